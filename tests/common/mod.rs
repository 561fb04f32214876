//! Shared test utilities: a JSON codec and an in-memory datagram transport
//! with scripted per-server behavior.

#![allow(dead_code)] // Not every helper is used by every test file.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hugin::codec::Codec;
use hugin::config::ResolverConfig;
use hugin::error::{ResolveError, Result};
use hugin::record::{Mx, Query, Rcode, Record, RecordData, RecordType, Response, ServerAddress, Srv};
use hugin::resolver::Resolver;
use hugin::transport::{DatagramSocket, SocketFactory};

/// Opt-in log output while debugging tests:
/// `RUST_LOG=hugin=trace cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Encodes queries and responses as JSON. The core never inspects the wire
/// bytes, so any reversible encoding works for tests.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, query: &Query) -> Result<Vec<u8>> {
        serde_json::to_vec(query).map_err(|e| ResolveError::InvalidArgument(e.to_string()))
    }

    fn decode(&self, datagram: &[u8]) -> Result<Response> {
        serde_json::from_slice(datagram).map_err(|e| ResolveError::MalformedResponse(e.to_string()))
    }
}

/// What a mock server does with one query.
pub enum MockReply {
    Respond { response: Response, delay: Duration },
    Ignore,
    FailSend,
}

/// Per-server script.
#[derive(Clone)]
pub struct Behavior {
    reply: Arc<dyn Fn(&Query) -> MockReply + Send + Sync>,
}

impl Behavior {
    pub fn with(f: impl Fn(&Query) -> MockReply + Send + Sync + 'static) -> Self {
        Self { reply: Arc::new(f) }
    }

    pub fn respond(f: impl Fn(&Query) -> Response + Send + Sync + 'static) -> Self {
        Self::respond_after(Duration::ZERO, f)
    }

    pub fn respond_after(
        delay: Duration,
        f: impl Fn(&Query) -> Response + Send + Sync + 'static,
    ) -> Self {
        Self::with(move |query| MockReply::Respond {
            response: f(query),
            delay,
        })
    }

    /// Accepts queries and never answers.
    pub fn black_hole() -> Self {
        Self::with(|_| MockReply::Ignore)
    }

    /// Fails the send syscall itself.
    pub fn fail_send() -> Self {
        Self::with(|_| MockReply::FailSend)
    }
}

/// Shared state of the in-memory network: behaviors plus a log of every
/// query that reached a server.
#[derive(Default)]
pub struct MockNet {
    behaviors: Mutex<HashMap<SocketAddr, Behavior>>,
    log: Mutex<Vec<(SocketAddr, Query)>>,
}

impl MockNet {
    pub fn set_behavior(&self, server: ServerAddress, behavior: Behavior) {
        self.behaviors.lock().insert(server.socket_addr(), behavior);
    }

    fn behavior(&self, server: SocketAddr) -> Option<Behavior> {
        self.behaviors.lock().get(&server).cloned()
    }

    fn log_query(&self, server: SocketAddr, query: Query) {
        self.log.lock().push((server, query));
    }

    /// Queries sent to one server, in order.
    pub fn queries_for(&self, server: ServerAddress) -> Vec<Query> {
        self.log
            .lock()
            .iter()
            .filter(|(addr, _)| *addr == server.socket_addr())
            .map(|(_, query)| query.clone())
            .collect()
    }

    pub fn sent_count(&self, server: ServerAddress) -> usize {
        self.queries_for(server).len()
    }

    pub fn total_sent(&self) -> usize {
        self.log.lock().len()
    }
}

pub struct MockSocket {
    server: SocketAddr,
    net: Arc<MockNet>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl DatagramSocket for MockSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let query: Query = serde_json::from_slice(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.net.log_query(self.server, query.clone());

        match self.net.behavior(self.server).map(|b| (b.reply)(&query)) {
            Some(MockReply::Respond { response, delay }) => {
                let bytes = serde_json::to_vec(&response)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = tx.send(bytes);
                });
                Ok(buf.len())
            }
            Some(MockReply::FailSend) => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock send failure",
            )),
            Some(MockReply::Ignore) | None => Ok(buf.len()),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.server)
    }
}

pub struct MockFactory {
    pub net: Arc<MockNet>,
}

#[async_trait]
impl SocketFactory for MockFactory {
    async fn connect(&self, server: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(MockSocket {
            server,
            net: self.net.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

// RFC 5737 TEST-NET addresses.
pub fn s1() -> ServerAddress {
    "192.0.2.1:53".parse().unwrap()
}

pub fn s2() -> ServerAddress {
    "192.0.2.2:53".parse().unwrap()
}

pub fn s3() -> ServerAddress {
    "192.0.2.3:53".parse().unwrap()
}

/// Resolver wired to the mock transport, with bootstrap validation off.
pub fn resolver_with(servers: &[ServerAddress]) -> (Resolver, Arc<MockNet>) {
    let mut config = ResolverConfig::default();
    config.servers = servers.to_vec();
    config.validate_servers = false;
    resolver_with_config(config)
}

pub fn resolver_with_config(config: ResolverConfig) -> (Resolver, Arc<MockNet>) {
    let net = Arc::new(MockNet::default());
    let resolver = Resolver::with_factory(
        config,
        Arc::new(JsonCodec),
        Arc::new(MockFactory { net: net.clone() }),
    );
    (resolver, net)
}

pub fn answer(query: &Query, records: Vec<Record>) -> Response {
    Response {
        id: query.id,
        rcode: Rcode::NoError,
        truncated: false,
        answers: records,
    }
}

pub fn nodata(query: &Query) -> Response {
    answer(query, Vec::new())
}

pub fn nxdomain(query: &Query) -> Response {
    Response {
        id: query.id,
        rcode: Rcode::NxDomain,
        truncated: false,
        answers: Vec::new(),
    }
}

pub fn rcode_error(query: &Query, rcode: Rcode) -> Response {
    Response {
        id: query.id,
        rcode,
        truncated: false,
        answers: Vec::new(),
    }
}

pub fn a_record(name: &str, ttl: u32, ip: [u8; 4]) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::A,
        ttl,
        data: RecordData::A(Ipv4Addr::from(ip)),
    }
}

pub fn aaaa_record(name: &str, ttl: u32, ip: Ipv6Addr) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::AAAA,
        ttl,
        data: RecordData::Aaaa(ip),
    }
}

pub fn mx_record(name: &str, ttl: u32, preference: u16, exchange: &str) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::MX,
        ttl,
        data: RecordData::Mx(Mx {
            preference,
            exchange: exchange.to_string(),
        }),
    }
}

pub fn srv_record(name: &str, ttl: u32, port: u16, target: &str) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::SRV,
        ttl,
        data: RecordData::Srv(Srv {
            priority: 0,
            weight: 5,
            port,
            target: target.to_string(),
        }),
    }
}

pub fn txt_record(name: &str, ttl: u32, strings: &[&str]) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::TXT,
        ttl,
        data: RecordData::Txt(strings.iter().map(|s| s.to_string()).collect()),
    }
}

pub fn ptr_record(name: &str, ttl: u32, target: &str) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::PTR,
        ttl,
        data: RecordData::Ptr(target.to_string()),
    }
}

pub fn ns_record(name: &str, ttl: u32, target: &str) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::NS,
        ttl,
        data: RecordData::Ns(target.to_string()),
    }
}

pub fn cname_record(name: &str, ttl: u32, target: &str) -> Record {
    Record {
        name: name.to_string(),
        rtype: RecordType::CNAME,
        ttl,
        data: RecordData::Cname(target.to_string()),
    }
}
