//! MX resolution over raw DNS.
//!
//! The resolver speaks the DNS wire protocol itself: it builds the query,
//! sends it over UDP (falling back to TCP when the reply comes back
//! truncated) and decodes the answer section with a small wire reader that
//! follows compression pointers. Results
//! are cached for a few minutes so that a burst of sends to the same domain
//! costs one lookup.

use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    io::{Read, Write},
    net::{IpAddr, SocketAddr, TcpStream, UdpSocket},
    sync::Mutex,
    time::{Duration, Instant},
};

use self::buffer::{DecodeError, WireBuffer};

mod buffer;

/// DNS well-known port
const DNS_PORT: u16 = 53;

/// Record type MX
const TYPE_MX: u16 = 15;

/// Class IN
const CLASS_IN: u16 = 1;

/// How long resolved MX lists stay fresh
const CACHE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Bound on a single query round trip
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced at the resolver boundary.
///
/// Wire decode problems never escape as such; they are folded into
/// [`ResolveError::QueryFailed`] here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The query could not be completed (network error, timeout, bad or
    /// mismatched response)
    QueryFailed(String),
    /// The domain offers no usable mail exchanger
    NoMailExchanger(String),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::QueryFailed(reason) => write!(f, "MX query failed: {reason}"),
            ResolveError::NoMailExchanger(domain) => {
                write!(f, "no mail exchanger for {domain}")
            }
        }
    }
}

impl StdError for ResolveError {}

impl From<DecodeError> for ResolveError {
    fn from(err: DecodeError) -> Self {
        ResolveError::QueryFailed(format!("malformed response: {err}"))
    }
}

fn io_failed(err: std::io::Error) -> ResolveError {
    ResolveError::QueryFailed(err.to_string())
}

/// A single MX record: a mail exchange host and its preference value
/// (lower is more preferred)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// The mail exchange host name
    pub exchange: String,
    /// Preference, ascending priority
    pub preference: u16,
}

/// Resolution of a domain to an ordered list of delivery hosts.
///
/// One production implementation ([`DnsResolver`]) exists; tests substitute
/// their own.
pub trait Resolve: Send + Sync {
    /// Returns the domain's mail exchange hosts, most preferred first.
    ///
    /// A domain that publishes no MX records at all resolves to itself
    /// (the implicit MX rule of RFC 5321 §5.1). `NoMailExchanger` is
    /// reserved for domains whose MX records name no usable host, such as
    /// a lone root exchange (RFC 7505 null MX).
    fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, ResolveError>;
}

/// One way of getting DNS query bytes answered
trait Exchange: Send + Sync {
    fn udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError>;
    fn tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError>;
}

impl<T: Exchange + ?Sized> Exchange for std::sync::Arc<T> {
    fn udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        (**self).udp(query)
    }

    fn tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        (**self).tcp(query)
    }
}

/// Production transport: datagram to the name server, TCP on demand
struct NameServerExchange {
    name_server: Option<SocketAddr>,
    timeout: Duration,
}

impl NameServerExchange {
    fn server(&self) -> Result<SocketAddr, ResolveError> {
        self.name_server
            .or_else(system_name_server)
            .ok_or_else(|| {
                ResolveError::QueryFailed(
                    "no name server configured and none found in /etc/resolv.conf".to_owned(),
                )
            })
    }
}

impl Exchange for NameServerExchange {
    fn udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let server = self.server()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(io_failed)?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(io_failed)?;
        socket.send_to(query, server).map_err(io_failed)?;

        let mut reply = vec![0u8; 2048];
        let (read, _) = socket.recv_from(&mut reply).map_err(io_failed)?;
        reply.truncate(read);
        Ok(reply)
    }

    fn tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let server = self.server()?;
        let mut stream = TcpStream::connect_timeout(&server, self.timeout).map_err(io_failed)?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(io_failed)?;

        // DNS over TCP prefixes each message with its length
        let len = u16::try_from(query.len())
            .map_err(|_| ResolveError::QueryFailed("query too large".to_owned()))?;
        stream.write_all(&len.to_be_bytes()).map_err(io_failed)?;
        stream.write_all(query).map_err(io_failed)?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).map_err(io_failed)?;
        let mut reply = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut reply).map_err(io_failed)?;
        Ok(reply)
    }
}

/// Reads the first `nameserver` line of `/etc/resolv.conf`
fn system_name_server() -> Option<SocketAddr> {
    let content = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.trim().strip_prefix("nameserver") {
            if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                return Some(SocketAddr::new(ip, DNS_PORT));
            }
        }
    }
    None
}

struct CacheEntry {
    hosts: Vec<String>,
    fetched_at: Instant,
}

/// The production resolver: raw DNS queries plus a time-bounded cache.
///
/// Safe to share between threads; the cache is the only mutable state.
pub struct DnsResolver {
    exchange: Box<dyn Exchange>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_timeout: Duration,
}

impl DnsResolver {
    /// Creates a resolver using the system name server from
    /// `/etc/resolv.conf`
    pub fn new() -> DnsResolver {
        DnsResolver::with_exchange(Box::new(NameServerExchange {
            name_server: None,
            timeout: QUERY_TIMEOUT,
        }))
    }

    /// Creates a resolver querying the given name server
    pub fn with_name_server(name_server: SocketAddr) -> DnsResolver {
        DnsResolver::with_exchange(Box::new(NameServerExchange {
            name_server: Some(name_server),
            timeout: QUERY_TIMEOUT,
        }))
    }

    fn with_exchange(exchange: Box<dyn Exchange>) -> DnsResolver {
        DnsResolver {
            exchange,
            cache: Mutex::new(HashMap::new()),
            cache_timeout: CACHE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// One full uncached lookup: query, transport fallback, decode
    fn lookup(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError> {
        let id = fastrand::u16(..);
        let query = build_query(id, domain)?;

        let reply = self.exchange.udp(&query)?;
        let parsed = match parse_reply(&reply, id)? {
            Reply::Truncated => {
                tracing::debug!(%domain, "UDP reply truncated, retrying over TCP");
                let reply = self.exchange.tcp(&query)?;
                match parse_reply(&reply, id)? {
                    Reply::Truncated => {
                        return Err(ResolveError::QueryFailed(
                            "TCP reply still truncated".to_owned(),
                        ))
                    }
                    Reply::Answers(records) => records,
                }
            }
            Reply::Answers(records) => records,
        };
        Ok(parsed)
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        DnsResolver::new()
    }
}

impl Resolve for DnsResolver {
    fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, ResolveError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(domain) {
                if entry.fetched_at.elapsed() < self.cache_timeout {
                    tracing::debug!(%domain, "cache hit");
                    return Ok(entry.hosts.clone());
                }
                // stale entries are never returned
            }
        }

        let mut records = self.lookup(domain)?;
        records.sort_by_key(|record| record.preference);

        let hosts: Vec<String> = records
            .into_iter()
            .map(|record| record.exchange)
            .collect();

        let hosts = if hosts.is_empty() {
            // implicit MX: a domain without MX records receives mail itself
            vec![domain.to_owned()]
        } else if hosts.iter().all(String::is_empty) {
            // null MX, the domain opted out of email entirely
            return Err(ResolveError::NoMailExchanger(domain.to_owned()));
        } else {
            hosts.into_iter().filter(|host| !host.is_empty()).collect()
        };

        tracing::debug!(%domain, hosts = ?hosts, "resolved");
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            domain.to_owned(),
            CacheEntry {
                hosts: hosts.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(hosts)
    }
}

/// Encodes a recursion-desired MX question for `domain`
fn build_query(id: u16, domain: &str) -> Result<Vec<u8>, ResolveError> {
    let mut query = Vec::with_capacity(17 + domain.len());
    query.extend_from_slice(&id.to_be_bytes());
    // flags: RD set, everything else zero
    query.extend_from_slice(&0x0100u16.to_be_bytes());
    // one question, no answer/authority/additional entries
    query.extend_from_slice(&1u16.to_be_bytes());
    query.extend_from_slice(&[0; 6]);

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ResolveError::QueryFailed(format!(
                "invalid domain name: {domain}"
            )));
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&TYPE_MX.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(query)
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// TC bit was set, retry over TCP
    Truncated,
    Answers(Vec<MxRecord>),
}

/// Decodes a DNS reply, keeping only MX answers
fn parse_reply(bytes: &[u8], expected_id: u16) -> Result<Reply, ResolveError> {
    let mut buf = WireBuffer::new(bytes);

    let id = buf.read_u16()?;
    if id != expected_id {
        return Err(ResolveError::QueryFailed("response id mismatch".to_owned()));
    }
    let flags = buf.read_u16()?;
    if flags & 0x8000 == 0 {
        return Err(ResolveError::QueryFailed(
            "response flag not set".to_owned(),
        ));
    }
    let rcode = flags & 0x000f;
    if rcode != 0 {
        return Err(ResolveError::QueryFailed(format!(
            "server returned rcode {rcode}"
        )));
    }
    if flags & 0x0200 != 0 {
        return Ok(Reply::Truncated);
    }

    let qdcount = buf.read_u16()?;
    let ancount = buf.read_u16()?;
    // authority and additional sections are not interpreted
    buf.skip(4)?;

    for _ in 0..qdcount {
        buf.read_name()?;
        buf.skip(4)?;
    }

    let mut records = Vec::new();
    for _ in 0..ancount {
        buf.read_name()?;
        let rtype = buf.read_u16()?;
        let _class = buf.read_u16()?;
        buf.skip(4)?; // TTL
        let rdlength = usize::from(buf.read_u16()?);
        let rdata_end = buf.position() + rdlength;

        if rtype == TYPE_MX {
            let preference = buf.read_u16()?;
            let exchange = buf.read_name()?;
            if buf.position() != rdata_end {
                return Err(ResolveError::QueryFailed(
                    "MX record length mismatch".to_owned(),
                ));
            }
            records.push(MxRecord {
                exchange,
                preference,
            });
        } else {
            buf.skip(rdlength)?;
        }
    }

    Ok(Reply::Answers(records))
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_name(out: &mut Vec<u8>, name: &str) {
        if !name.is_empty() {
            for label in name.split('.') {
                out.push(label.len() as u8);
                out.extend_from_slice(label.as_bytes());
            }
        }
        out.push(0);
    }

    /// Builds a reply to `query` with the given (preference, exchange)
    /// answers, echoing the query id and question section
    fn mx_reply(query: &[u8], answers: &[(u16, &str)], truncated: bool) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&query[..2]);
        let flags: u16 = 0x8180 | if truncated { 0x0200 } else { 0 };
        reply.extend_from_slice(&flags.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        reply.extend_from_slice(&[0; 4]);
        // echo the question
        reply.extend_from_slice(&query[12..]);

        for (preference, exchange) in answers {
            // owner name as a pointer to the question name
            reply.extend_from_slice(&[0xc0, 0x0c]);
            reply.extend_from_slice(&TYPE_MX.to_be_bytes());
            reply.extend_from_slice(&CLASS_IN.to_be_bytes());
            reply.extend_from_slice(&300u32.to_be_bytes());
            let mut rdata = Vec::new();
            rdata.extend_from_slice(&preference.to_be_bytes());
            encode_name(&mut rdata, exchange);
            reply.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            reply.extend_from_slice(&rdata);
        }
        reply
    }

    /// Scripted transport: answers every UDP query from a fixed record
    /// set, counting queries, optionally forcing the TCP fallback
    struct ScriptedExchange {
        answers: Vec<(u16, &'static str)>,
        truncate_udp: bool,
        udp_queries: AtomicUsize,
        tcp_queries: AtomicUsize,
    }

    impl ScriptedExchange {
        fn new(answers: Vec<(u16, &'static str)>) -> ScriptedExchange {
            ScriptedExchange {
                answers,
                truncate_udp: false,
                udp_queries: AtomicUsize::new(0),
                tcp_queries: AtomicUsize::new(0),
            }
        }
    }

    impl Exchange for ScriptedExchange {
        fn udp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
            self.udp_queries.fetch_add(1, Ordering::SeqCst);
            Ok(mx_reply(query, &self.answers, self.truncate_udp))
        }

        fn tcp(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
            self.tcp_queries.fetch_add(1, Ordering::SeqCst);
            Ok(mx_reply(query, &self.answers, false))
        }
    }

    #[test]
    fn build_query_layout() {
        let query = build_query(0x1234, "example.com").unwrap();
        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        assert_eq!(&query[4..6], &[0, 1]);
        let mut expected_name = Vec::new();
        encode_name(&mut expected_name, "example.com");
        assert_eq!(&query[12..12 + expected_name.len()], &expected_name[..]);
        assert_eq!(&query[query.len() - 4..], &[0, 15, 0, 1]);
    }

    #[test]
    fn build_query_rejects_long_label() {
        let label = "a".repeat(64);
        assert!(build_query(1, &format!("{label}.com")).is_err());
    }

    #[test]
    fn parse_reply_orders_by_preference() {
        let query = build_query(7, "example.com").unwrap();
        let reply = mx_reply(
            &query,
            &[(20, "backup.example.com"), (10, "mx.example.com"), (20, "other.example.com")],
            false,
        );
        let Reply::Answers(mut records) = parse_reply(&reply, 7).unwrap() else {
            panic!("unexpected truncation");
        };
        records.sort_by_key(|record| record.preference);
        assert_eq!(
            records,
            vec![
                MxRecord {
                    exchange: "mx.example.com".to_owned(),
                    preference: 10,
                },
                MxRecord {
                    exchange: "backup.example.com".to_owned(),
                    preference: 20,
                },
                MxRecord {
                    exchange: "other.example.com".to_owned(),
                    preference: 20,
                },
            ]
        );
    }

    #[test]
    fn parse_reply_rejects_id_mismatch() {
        let query = build_query(7, "example.com").unwrap();
        let reply = mx_reply(&query, &[], false);
        assert_eq!(
            parse_reply(&reply, 8),
            Err(ResolveError::QueryFailed("response id mismatch".to_owned()))
        );
    }

    #[test]
    fn resolve_returns_most_preferred_first() {
        let resolver = DnsResolver::with_exchange(Box::new(ScriptedExchange::new(vec![
            (20, "backup.example.com"),
            (10, "mx.example.com"),
        ])));
        assert_eq!(
            resolver.resolve_mx("example.com").unwrap(),
            vec!["mx.example.com".to_owned(), "backup.example.com".to_owned()]
        );
    }

    #[test]
    fn resolve_falls_back_to_domain_without_mx() {
        let resolver = DnsResolver::with_exchange(Box::new(ScriptedExchange::new(vec![])));
        assert_eq!(
            resolver.resolve_mx("example.com").unwrap(),
            vec!["example.com".to_owned()]
        );
    }

    #[test]
    fn resolve_reports_null_mx() {
        let resolver =
            DnsResolver::with_exchange(Box::new(ScriptedExchange::new(vec![(0, "")])));
        assert_eq!(
            resolver.resolve_mx("example.com"),
            Err(ResolveError::NoMailExchanger("example.com".to_owned()))
        );
    }

    #[test]
    fn truncated_udp_reply_falls_back_to_tcp() {
        let mut exchange = ScriptedExchange::new(vec![(10, "mx.example.com")]);
        exchange.truncate_udp = true;
        let resolver = DnsResolver::with_exchange(Box::new(exchange));
        assert_eq!(
            resolver.resolve_mx("example.com").unwrap(),
            vec!["mx.example.com".to_owned()]
        );
    }

    #[test]
    fn fresh_cache_entry_skips_the_network() {
        let exchange = std::sync::Arc::new(ScriptedExchange::new(vec![(10, "mx.example.com")]));
        let resolver = DnsResolver::with_exchange(Box::new(std::sync::Arc::clone(&exchange)));

        resolver.resolve_mx("example.com").unwrap();
        resolver.resolve_mx("example.com").unwrap();
        assert_eq!(exchange.udp_queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_cache_entry_triggers_a_new_query() {
        let exchange = std::sync::Arc::new(ScriptedExchange::new(vec![(10, "mx.example.com")]));
        let resolver = DnsResolver::with_exchange(Box::new(std::sync::Arc::clone(&exchange)))
            .cache_timeout(Duration::from_secs(0));

        resolver.resolve_mx("example.com").unwrap();
        resolver.resolve_mx("example.com").unwrap();
        assert_eq!(exchange.udp_queries.load(Ordering::SeqCst), 2);
    }
}
