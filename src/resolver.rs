use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use moka::sync::Cache;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::new_cache;

/// Address family requested from the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
}

impl RecordKind {
    /// AAAA (28) asks for IPv6; every other query type is answered with A.
    pub fn from_qtype(qtype: RecordType) -> Self {
        if qtype == RecordType::AAAA {
            RecordKind::Aaaa
        } else {
            RecordKind::A
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no {kind:?} records for {name}")]
    NoRecords { name: String, kind: RecordKind },
    #[error("upstream lookup failed: {0}")]
    Upstream(String),
}

impl LookupError {
    fn from_resolve(name: &str, kind: RecordKind, err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => LookupError::NoRecords {
                name: name.to_string(),
                kind,
            },
            _ => LookupError::Upstream(err.to_string()),
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn lookup(&self, name: &str, kind: RecordKind) -> Result<Vec<IpAddr>, LookupError>;
}

/// The host's recursive resolver, configured from the system settings.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        let (config, opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(err) => {
                warn!(error = %err, "cannot read system resolver config, using library defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self::with_config(config, opts, timeout)
    }

    pub fn with_config(config: ResolverConfig, mut opts: ResolverOpts, timeout: Duration) -> Self {
        opts.timeout = timeout;
        // CachingResolver is the only answer cache; negative replies must
        // reach the upstream every time.
        opts.cache_size = 0;
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl Upstream for SystemResolver {
    async fn lookup(&self, name: &str, kind: RecordKind) -> Result<Vec<IpAddr>, LookupError> {
        // absolute name so resolv.conf search domains never apply
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        let addrs: Vec<IpAddr> = match kind {
            RecordKind::A => self
                .inner
                .ipv4_lookup(fqdn.as_str())
                .await
                .map_err(|e| LookupError::from_resolve(name, kind, e))?
                .iter()
                .map(|a| IpAddr::V4(a.0))
                .collect(),
            RecordKind::Aaaa => self
                .inner
                .ipv6_lookup(fqdn.as_str())
                .await
                .map_err(|e| LookupError::from_resolve(name, kind, e))?
                .iter()
                .map(|a| IpAddr::V6(a.0))
                .collect(),
        };
        Ok(addrs)
    }
}

/// Cache key for upstream answers. Its own type, so it can never be mixed
/// up with a decision-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AnswerKey {
    name: Arc<str>,
    kind: RecordKind,
}

/// Caches successful, non-empty upstream answers. Failures always go back
/// to the upstream on the next query.
#[derive(Clone)]
pub struct CachingResolver {
    upstream: Arc<dyn Upstream>,
    cache: Cache<AnswerKey, Arc<[IpAddr]>>,
}

impl CachingResolver {
    pub fn new(upstream: Arc<dyn Upstream>, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            upstream,
            cache: new_cache(max_capacity, ttl),
        }
    }

    /// Returns the addresses and whether they came from the cache.
    pub async fn resolve(
        &self,
        name: &str,
        kind: RecordKind,
    ) -> Result<(Arc<[IpAddr]>, bool), LookupError> {
        let key = AnswerKey {
            name: Arc::from(name),
            kind,
        };
        if let Some(hit) = self.cache.get(&key) {
            return Ok((hit, true));
        }

        let addrs = self.upstream.lookup(name, kind).await?;
        if addrs.is_empty() {
            return Err(LookupError::NoRecords {
                name: name.to_string(),
                kind,
            });
        }
        let addrs: Arc<[IpAddr]> = Arc::from(addrs);
        debug!(qname = %name, kind = ?kind, answers = addrs.len(), "upstream answer cached");
        self.cache.insert(key, Arc::clone(&addrs));
        Ok((addrs, false))
    }
}
