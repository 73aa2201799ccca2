//! In-memory fakes with call counters for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::resolver::{LookupError, RecordKind, Upstream};
use crate::store::{BlocklistStore, normalize_name};

pub struct MemoryBlocklist {
    names: HashSet<String>,
    calls: AtomicUsize,
}

impl MemoryBlocklist {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| normalize_name(n)).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlocklistStore for MemoryBlocklist {
    async fn is_blocked(&self, name: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.names.contains(&normalize_name(name))
    }
}

/// Answers only what was scripted; anything else fails like a SERVFAIL.
pub struct ScriptedUpstream {
    answers: Mutex<HashMap<(String, RecordKind), Vec<IpAddr>>>,
    calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answer(&self, name: &str, kind: RecordKind, addrs: &[&str]) {
        let addrs = addrs
            .iter()
            .map(|a| a.parse().expect("test address"))
            .collect();
        self.answers
            .lock()
            .expect("answers lock")
            .insert((name.to_string(), kind), addrs);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn lookup(&self, name: &str, kind: RecordKind) -> Result<Vec<IpAddr>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .expect("answers lock")
            .get(&(name.to_string(), kind))
            .cloned()
            .ok_or_else(|| LookupError::Upstream(format!("no script for {name}")))
    }
}
