use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use thiserror::Error;
use tracing::debug;

use crate::cache::{DecisionCache, Verdict};
use crate::config::GlobalSettings;
use crate::resolver::{CachingResolver, RecordKind, Upstream};
use crate::store::{BlocklistStore, normalize_name};

const NULL_ROUTE: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Reasons a datagram ends without a reply.
#[derive(Debug, Error)]
pub enum Dropped {
    #[error("malformed query: {0}")]
    Decode(ProtoError),
    #[error("query has no question")]
    NoQuestion,
    #[error("encode response: {0}")]
    Encode(ProtoError),
}

#[derive(Debug, Clone)]
enum Outcome {
    Blocked,
    Answered {
        addrs: Arc<[IpAddr]>,
        cached: bool,
    },
    /// Upstream failed or had nothing; answered with an empty NOERROR.
    NoData,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Blocked => "blocked",
            Outcome::Answered { .. } => "forwarded",
            Outcome::NoData => "no_data",
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn BlocklistStore>,
    decisions: DecisionCache,
    resolver: CachingResolver,
    answer_ttl: u32,
    pub metrics_total_requests: Arc<AtomicU64>,
    pub metrics_blocked: Arc<AtomicU64>,
    pub metrics_decision_hits: Arc<AtomicU64>,
    pub metrics_upstream_failures: Arc<AtomicU64>,
    pub metrics_dropped: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(
        settings: &GlobalSettings,
        store: Arc<dyn BlocklistStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let ttl = settings.cache_ttl();
        Self {
            store,
            decisions: DecisionCache::new(
                settings.blocked_capacity(),
                settings.allowed_capacity(),
                ttl,
            ),
            resolver: CachingResolver::new(upstream, settings.resolver_cache_capacity, ttl),
            answer_ttl: settings.answer_ttl,
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
            metrics_blocked: Arc::new(AtomicU64::new(0)),
            metrics_decision_hits: Arc::new(AtomicU64::new(0)),
            metrics_upstream_failures: Arc::new(AtomicU64::new(0)),
            metrics_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn metrics_snapshot(&self) -> String {
        format!(
            "total={} blocked={} decision_cache_hits={} upstream_failures={} dropped={}",
            self.metrics_total_requests.load(Ordering::Relaxed),
            self.metrics_blocked.load(Ordering::Relaxed),
            self.metrics_decision_hits.load(Ordering::Relaxed),
            self.metrics_upstream_failures.load(Ordering::Relaxed),
            self.metrics_dropped.load(Ordering::Relaxed),
        )
    }

    /// Decode a query datagram and produce the encoded reply.
    ///
    /// `Err` means the packet is discarded and nothing is sent back.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes, Dropped> {
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);
        let res = self.process(packet, peer).await;
        if res.is_err() {
            self.metrics_dropped.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    async fn process(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes, Dropped> {
        let start = Instant::now();
        let req = Message::from_bytes(packet).map_err(Dropped::Decode)?;
        // only the first question is answered
        let question = req.queries().first().ok_or(Dropped::NoQuestion)?;
        let qname = normalize_name(&question.name().to_ascii());
        let qtype = question.query_type();

        let (blocked, decision_cached) = self.classify(&qname).await;
        let outcome = if blocked {
            self.metrics_blocked.fetch_add(1, Ordering::Relaxed);
            Outcome::Blocked
        } else {
            let kind = RecordKind::from_qtype(qtype);
            match self.resolver.resolve(&qname, kind).await {
                Ok((addrs, cached)) => Outcome::Answered { addrs, cached },
                Err(err) => {
                    self.metrics_upstream_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(qname = %qname, qtype = ?qtype, error = %err, "upstream lookup failed");
                    Outcome::NoData
                }
            }
        };

        let resp = build_response(req.id(), question, &outcome, self.answer_ttl)
            .map_err(Dropped::Encode)?;

        let (answers, cache) = match &outcome {
            Outcome::Blocked => (1, decision_cached),
            Outcome::Answered { addrs, cached } => (addrs.len(), *cached),
            Outcome::NoData => (0, false),
        };
        debug!(
            event = "dns_response",
            qname = %qname,
            qtype = ?qtype,
            client_ip = %peer.ip(),
            verdict = outcome.label(),
            answers,
            cache,
            latency_ms = start.elapsed().as_millis() as u64,
            "query answered"
        );
        Ok(resp)
    }

    /// Blocked or not, plus whether the decision cache already knew.
    async fn classify(&self, qname: &str) -> (bool, bool) {
        match self.decisions.lookup(qname) {
            Verdict::Blocked => {
                self.metrics_decision_hits.fetch_add(1, Ordering::Relaxed);
                (true, true)
            }
            Verdict::Allowed => {
                self.metrics_decision_hits.fetch_add(1, Ordering::Relaxed);
                (false, true)
            }
            Verdict::Unknown => {
                let blocked = self.store.is_blocked(qname).await;
                if blocked {
                    self.decisions.record_blocked(qname);
                } else {
                    self.decisions.record_allowed(qname);
                }
                (blocked, false)
            }
        }
    }
}

/// Blocked names always get a single A record for 0.0.0.0, whatever type
/// was asked. Recursion-available is only set when answers are present.
fn build_response(
    id: u16,
    question: &Query,
    outcome: &Outcome,
    ttl: u32,
) -> Result<Bytes, ProtoError> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.set_authoritative(false);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_query(question.clone());

    match outcome {
        Outcome::Blocked => {
            msg.set_recursion_available(true);
            msg.add_answer(address_record(question, IpAddr::V4(NULL_ROUTE), ttl));
        }
        Outcome::Answered { addrs, .. } => {
            msg.set_recursion_available(true);
            for addr in addrs.iter() {
                msg.add_answer(address_record(question, *addr, ttl));
            }
        }
        Outcome::NoData => {
            msg.set_recursion_available(false);
        }
    }

    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

fn address_record(question: &Query, addr: IpAddr, ttl: u32) -> Record {
    let rdata = match addr {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Record::from_rdata(question.name().clone(), ttl, rdata)
}
