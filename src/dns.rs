use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long a query may run before it is converted to `DnsError::Timeout`.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Lifetime for cached NXDOMAIN answers.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);
/// Upper bound on positive cache lifetime regardless of record TTL.
const MAX_POSITIVE_TTL: Duration = Duration::from_secs(300);

/// Typed resolver outcome, the only error surface handlers see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("NXDOMAIN")]
    NxDomain,
    #[error("servfail")]
    ServFail,
    #[error("query timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl DnsError {
    /// Whether a handler should report temperror (retryable) rather than
    /// treat the answer as definitively absent.
    pub fn is_temporary(&self) -> bool {
        matches!(self, DnsError::ServFail | DnsError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Mx,
    Ptr,
    Txt,
}

impl QueryType {
    fn record_type(self) -> RecordType {
        match self {
            QueryType::A => RecordType::A,
            QueryType::Aaaa => RecordType::AAAA,
            QueryType::Mx => RecordType::MX,
            QueryType::Ptr => RecordType::PTR,
            QueryType::Txt => RecordType::TXT,
        }
    }
}

type CacheKey = (String, QueryType);
type Answer = Result<Arc<Vec<String>>, DnsError>;

struct CacheEntry {
    answer: Answer,
    expires: Instant,
    inserted: Instant,
}

struct Cache {
    entries: HashMap<CacheKey, CacheEntry>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Cache {
            entries: HashMap::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Answer> {
        match self.entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.answer.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: CacheKey, answer: Answer, ttl: Duration) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                answer,
                expires: now + ttl,
                inserted: now,
            },
        );
    }

    fn evict(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires > now);
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Worker-wide resolver facade: every handler lookup goes through here.
///
/// Wraps a hickory `TokioAsyncResolver` driven by a current-thread runtime
/// (DNS is the only async I/O in a worker; everything else is plain
/// blocking sockets) with a TTL+capacity cache in front and a per-query
/// deadline. Handlers never see hickory types.
pub struct Resolver {
    runtime: tokio::runtime::Runtime,
    inner: TokioAsyncResolver,
    timeout: Duration,
    cache: Mutex<Cache>,
}

impl Resolver {
    pub fn new(timeout: Option<Duration>, cache_size: usize) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            log::warn!("no usable system resolver config ({err}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Ok(Resolver {
            runtime,
            inner,
            timeout: timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT),
            cache: Mutex::new(Cache::new(cache_size)),
        })
    }

    /// Look up `qname`/`qtype`, returning the answer set as strings
    /// (addresses, exchange names, PTR targets, or concatenated TXT data,
    /// one per record).
    pub fn lookup(&self, qname: &str, qtype: QueryType) -> Answer {
        let key = (qname.to_lowercase(), qtype);
        if let Some(answer) = self.cache.lock().unwrap().get(&key) {
            log::trace!("dns cache hit for {key:?}");
            return answer;
        }

        let fut = self.inner.lookup(qname, qtype.record_type());
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, fut).await });

        let (answer, ttl) = match outcome {
            Err(_elapsed) => (Err(DnsError::Timeout), Duration::ZERO),
            Ok(Err(err)) => {
                let mapped = map_resolve_error(err);
                let ttl = if mapped == DnsError::NxDomain {
                    NEGATIVE_TTL
                } else {
                    Duration::ZERO
                };
                (Err(mapped), ttl)
            }
            Ok(Ok(lookup)) => {
                let mut values = Vec::new();
                for rdata in lookup.iter() {
                    if let Some(value) = rdata_to_string(rdata) {
                        values.push(value);
                    }
                }
                let ttl = lookup
                    .valid_until()
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_POSITIVE_TTL);
                (Ok(Arc::new(values)), ttl)
            }
        };

        if ttl > Duration::ZERO {
            self.cache.lock().unwrap().insert(key, answer.clone(), ttl);
        }
        answer
    }

    /// Reverse lookup of `ip`, names without the trailing dot.
    pub fn reverse(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let fut = self.inner.reverse_lookup(ip);
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, fut).await });
        match outcome {
            Err(_elapsed) => Err(DnsError::Timeout),
            Ok(Err(err)) => Err(map_resolve_error(err)),
            Ok(Ok(lookup)) => Ok(lookup
                .iter()
                .map(|ptr| trim_root(&ptr.0.to_utf8()))
                .collect()),
        }
    }

    /// Does any address record of `name` match `ip`?
    pub fn forward_confirms(&self, name: &str, ip: IpAddr) -> Result<bool, DnsError> {
        let qtype = if ip.is_ipv4() { QueryType::A } else { QueryType::Aaaa };
        let addrs = self.lookup(name, qtype)?;
        Ok(addrs.iter().any(|a| a.parse::<IpAddr>() == Ok(ip)))
    }

    /// The iprev computation: reverse-resolve `ip`, then return the first
    /// name whose forward lookup confirms the address.
    pub fn verified_ptr(&self, ip: IpAddr) -> Result<Option<String>, DnsError> {
        let names = match self.reverse(ip) {
            Ok(names) => names,
            Err(DnsError::NxDomain) => return Ok(None),
            Err(err) => return Err(err),
        };
        for name in names {
            match self.forward_confirms(&name, ip) {
                Ok(true) => return Ok(Some(name)),
                Ok(false) | Err(DnsError::NxDomain) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

fn rdata_to_string(rdata: &RData) -> Option<String> {
    match rdata {
        RData::A(a) => Some(a.to_string()),
        RData::AAAA(aaaa) => Some(aaaa.to_string()),
        RData::MX(mx) => Some(trim_root(&mx.exchange().to_utf8())),
        RData::PTR(ptr) => Some(trim_root(&ptr.0.to_utf8())),
        RData::CNAME(name) => Some(trim_root(&name.0.to_utf8())),
        RData::TXT(txt) => {
            let mut joined = String::new();
            for part in txt.iter() {
                joined.push_str(&String::from_utf8_lossy(part));
            }
            Some(joined)
        }
        _ => None,
    }
}

fn trim_root(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

fn map_resolve_error(err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::ServFail => DnsError::ServFail,
            _ => DnsError::NxDomain,
        },
        ResolveErrorKind::Timeout => DnsError::Timeout,
        ResolveErrorKind::Proto(err) => DnsError::Malformed(err.to_string()),
        ResolveErrorKind::Msg(msg) => DnsError::Malformed(msg.clone()),
        ResolveErrorKind::Message(msg) => DnsError::Malformed((*msg).to_string()),
        _ => DnsError::ServFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_returns_until_expiry() {
        let mut cache = Cache::new(4);
        let key = ("example.com".to_string(), QueryType::A);
        cache.insert(
            key.clone(),
            Ok(Arc::new(vec!["192.0.2.1".to_string()])),
            Duration::from_secs(30),
        );
        let hit = cache.get(&key).unwrap().unwrap();
        assert_eq!(hit.as_slice(), ["192.0.2.1".to_string()]);
    }

    #[test]
    fn test_cache_expired_entries_are_dropped() {
        let mut cache = Cache::new(4);
        let key = ("example.com".to_string(), QueryType::A);
        cache.insert(key.clone(), Err(DnsError::NxDomain), Duration::ZERO);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_cache_capacity_evicts_oldest() {
        let mut cache = Cache::new(2);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            cache.insert(
                (name.to_string(), QueryType::Txt),
                Ok(Arc::new(vec![i.to_string()])),
                Duration::from_secs(60),
            );
        }
        assert!(cache.entries.len() <= 2);
        // The newest entry always survives.
        assert!(cache.get(&("c".to_string(), QueryType::Txt)).is_some());
    }

    #[test]
    fn test_negative_answers_are_cacheable() {
        let mut cache = Cache::new(4);
        let key = ("nx.example.com".to_string(), QueryType::Txt);
        cache.insert(key.clone(), Err(DnsError::NxDomain), NEGATIVE_TTL);
        assert_eq!(cache.get(&key), Some(Err(DnsError::NxDomain)));
    }

    #[test]
    fn test_temporary_classification() {
        assert!(DnsError::Timeout.is_temporary());
        assert!(DnsError::ServFail.is_temporary());
        assert!(!DnsError::NxDomain.is_temporary());
        assert!(!DnsError::Malformed("junk".to_string()).is_temporary());
    }
}
