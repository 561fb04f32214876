use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::RecordCache;
use crate::codec::Codec;
use crate::config::{NameserverProvider, ResolverConfig};
use crate::dispatcher::{QueryDispatcher, RaceResult};
use crate::error::{ResolveError, Result};
use crate::pool::ServerPool;
use crate::record::{Mx, Query, Record, RecordData, RecordType, ServerAddress, Srv};
use crate::transport::{SocketFactory, UdpSocketFactory};
use crate::txid::TxidAllocator;
use crate::validation::normalize_name;

/// Address family selector for [`Resolver::lookup_family`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Any,
}

/// Stub resolver facade.
///
/// Translates typed lookups into dispatcher submissions, consults and fills
/// the record cache, and fails over across the server pool. All lookup
/// methods are non-blocking; awaiting the returned future drives the query.
pub struct Resolver {
    config: ResolverConfig,
    codec: Arc<dyn Codec>,
    txid: Arc<TxidAllocator>,
    cache: Arc<RecordCache>,
    pool: Arc<ServerPool>,
    dispatcher: QueryDispatcher,
}

impl Resolver {
    pub fn new(config: ResolverConfig, codec: Arc<dyn Codec>) -> Self {
        let buffer_bytes = config.socket_buffer_bytes;
        Self::with_factory(config, codec, Arc::new(UdpSocketFactory::new(buffer_bytes)))
    }

    /// Builds a resolver over a caller-supplied socket factory. Tests use
    /// this to substitute an in-memory transport.
    pub fn with_factory(
        config: ResolverConfig,
        codec: Arc<dyn Codec>,
        factory: Arc<dyn SocketFactory>,
    ) -> Self {
        let dispatcher = QueryDispatcher::new(codec.clone());
        let txid = Arc::new(TxidAllocator::new());
        let pool = Arc::new(ServerPool::new(
            config.servers.clone(),
            factory,
            dispatcher.clone(),
            txid.clone(),
            config.max_failures_before_retire,
        ));
        let cache = Arc::new(RecordCache::new(
            config.max_cache_entries,
            config.negative_ttl,
        ));
        info!(
            servers = config.servers.len(),
            timeout_ms = config.request_timeout.as_millis() as u64,
            cache_entries = config.max_cache_entries,
            "resolver initialized"
        );
        Self {
            config,
            codec,
            txid,
            cache,
            pool,
            dispatcher,
        }
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Single address record: races A against AAAA, first answer wins.
    pub async fn lookup(&self, name: &str) -> Result<Record> {
        let records = self
            .resolve_records(name, None, &[RecordType::A, RecordType::AAAA])
            .await?;
        records.into_iter().next().ok_or(ResolveError::Empty)
    }

    /// Address records restricted to a family; `Any` races A against AAAA.
    pub async fn lookup_family(&self, name: &str, family: Family) -> Result<Vec<Record>> {
        let types: &[RecordType] = match family {
            Family::V4 => &[RecordType::A],
            Family::V6 => &[RecordType::AAAA],
            Family::Any => &[RecordType::A, RecordType::AAAA],
        };
        self.resolve_records(name, None, types).await
    }

    /// General lookup: the given types race on one server, first non-empty
    /// answer wins. `server = None` uses the pool with failover.
    pub async fn resolve(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[RecordType],
    ) -> Result<Vec<Record>> {
        self.resolve_records(name, server, types).await
    }

    /// As [`resolve`](Resolver::resolve), returning only the first record.
    pub async fn resolve_single(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[RecordType],
    ) -> Result<Record> {
        let records = self.resolve_records(name, server, types).await?;
        records.into_iter().next().ok_or(ResolveError::Empty)
    }

    pub async fn resolve4(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let records = self.resolve_records(name, None, &[RecordType::A]).await?;
        Ok(extract(records, |data| match data {
            RecordData::A(ip) => Some(ip),
            _ => None,
        }))
    }

    pub async fn resolve6(&self, name: &str) -> Result<Vec<Ipv6Addr>> {
        let records = self.resolve_records(name, None, &[RecordType::AAAA]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Aaaa(ip) => Some(ip),
            _ => None,
        }))
    }

    pub async fn resolve_mx(&self, name: &str) -> Result<Vec<Mx>> {
        let records = self.resolve_records(name, None, &[RecordType::MX]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Mx(mx) => Some(mx),
            _ => None,
        }))
    }

    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<Srv>> {
        let records = self.resolve_records(name, None, &[RecordType::SRV]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Srv(srv) => Some(srv),
            _ => None,
        }))
    }

    pub async fn resolve_txt(&self, name: &str) -> Result<Vec<Vec<String>>> {
        let records = self.resolve_records(name, None, &[RecordType::TXT]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Txt(txt) => Some(txt),
            _ => None,
        }))
    }

    pub async fn resolve_cname(&self, name: &str) -> Result<Vec<String>> {
        let records = self.resolve_records(name, None, &[RecordType::CNAME]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Cname(cname) => Some(cname),
            _ => None,
        }))
    }

    pub async fn resolve_ns(&self, name: &str) -> Result<Vec<String>> {
        let records = self.resolve_records(name, None, &[RecordType::NS]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Ns(ns) => Some(ns),
            _ => None,
        }))
    }

    /// Reverse lookup: PTR names for an address, via `in-addr.arpa` or the
    /// nibble-reversed `ip6.arpa` form.
    pub async fn reverse(&self, ip: IpAddr) -> Result<Vec<String>> {
        let name = reverse_name(ip);
        let records = self.resolve_records(&name, None, &[RecordType::PTR]).await?;
        Ok(extract(records, |data| match data {
            RecordData::Ptr(ptr) => Some(ptr),
            _ => None,
        }))
    }

    pub fn add_dns_server(&self, addr: ServerAddress) -> bool {
        self.pool.add(addr)
    }

    pub fn remove_dns_server(&self, addr: ServerAddress) -> bool {
        self.pool.remove(addr)
    }

    pub fn get_dns_server(&self, index: usize) -> Option<ServerAddress> {
        self.pool.get(index)
    }

    /// Canary lookup against one server with the core timeout.
    pub async fn validate_server(&self, addr: ServerAddress) -> bool {
        self.pool
            .validate(
                addr,
                &self.config.validation_canary,
                self.config.request_timeout,
            )
            .await
    }

    /// Synchronous canary validation: blocks the calling thread until the
    /// lookup completes or the timeout passes. The query is driven on a
    /// dedicated worker, never on the socket read loops; see
    /// [`ServerPool::validate_blocking`] for the runtime handling.
    pub fn validate_server_blocking(&self, addr: ServerAddress, timeout: Duration) -> bool {
        self.pool
            .validate_blocking(addr, &self.config.validation_canary, timeout)
    }

    /// Bootstrap path: parses OS-supplied nameserver strings, filters them
    /// through canary validation when enabled, and appends the survivors.
    /// Returns how many servers were added.
    pub async fn apply_system_servers(&self, provider: &dyn NameserverProvider) -> usize {
        let raw = provider.nameservers().await;
        let mut candidates = Vec::new();
        for entry in raw {
            match entry.parse::<ServerAddress>() {
                Ok(addr) => candidates.push(addr),
                Err(e) => warn!(entry = %entry, error = %e, "skipping unparseable nameserver"),
            }
        }

        let accepted: Vec<ServerAddress> = if self.config.validate_servers {
            let checks = candidates
                .iter()
                .map(|addr| self.validate_server(*addr))
                .collect::<Vec<_>>();
            candidates
                .iter()
                .zip(join_all(checks).await)
                .filter_map(|(addr, ok)| {
                    if ok {
                        Some(*addr)
                    } else {
                        warn!(server = %addr, "dropping unresponsive system nameserver");
                        None
                    }
                })
                .collect()
        } else {
            candidates
        };

        let mut added = 0;
        for addr in accepted {
            if self.pool.add(addr) {
                added += 1;
            }
        }
        added
    }

    async fn resolve_records(
        &self,
        name: &str,
        server: Option<ServerAddress>,
        types: &[RecordType],
    ) -> Result<Vec<Record>> {
        if types.is_empty() {
            return Err(ResolveError::InvalidArgument(
                "no record types requested".into(),
            ));
        }
        let name = normalize_name(name)?;

        // Cache probe, in type order. A positive hit wins outright; negative
        // hits only short-circuit once every requested type has one, keeping
        // the "only non-empty wins" race semantics.
        let mut negative_hits = 0;
        for rtype in types {
            match self.cache.get_records(&name, *rtype) {
                Some(records) if !records.is_empty() => return Ok(records),
                Some(_) => negative_hits += 1,
                None => {}
            }
        }
        if negative_hits == types.len() {
            return Ok(Vec::new());
        }

        let attempts = self.failover_order(server)?;
        let mut last_error: Option<ResolveError> = None;

        for (attempt, srv) in attempts.iter().enumerate() {
            match self.query_server(&name, types, *srv).await {
                Ok(outcome) => {
                    self.pool.record_success(*srv);
                    return Ok(self.fill_cache(&name, types, outcome));
                }
                Err(e) if e.is_retryable() => {
                    self.pool.record_failure(*srv);
                    warn!(
                        server = %srv,
                        attempt = attempt + 1,
                        error = %e,
                        "upstream attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ResolveError::NoServers))
    }

    /// Servers to try, in order: the whole pool starting at the primary, or
    /// starting at the supplied server and wrapping around the pool. A
    /// supplied server outside the pool is tried alone.
    fn failover_order(&self, server: Option<ServerAddress>) -> Result<Vec<ServerAddress>> {
        let mut servers = self.pool.servers();
        match server {
            None => {
                if servers.is_empty() {
                    return Err(ResolveError::NoServers);
                }
                Ok(servers)
            }
            Some(start) => match servers.iter().position(|s| *s == start) {
                Some(index) => {
                    servers.rotate_left(index);
                    Ok(servers)
                }
                None => Ok(vec![start]),
            },
        }
    }

    /// One submission against one server: allocate an id per type (skipping
    /// ids pending on the channel), encode, and race. An id collision is
    /// re-allocated and retried once.
    async fn query_server(
        &self,
        name: &str,
        types: &[RecordType],
        server: ServerAddress,
    ) -> Result<RaceResult> {
        let channel = self.pool.socket_for(server).await?;
        let _flight = channel.begin_flight();

        for pass in 0..2 {
            let deadline = Instant::now() + self.config.request_timeout;
            let mut queries = Vec::with_capacity(types.len());
            for rtype in types {
                let mut id = self.txid.next();
                if self.dispatcher.is_pending(channel.socket_id(), id) {
                    id = self.txid.next();
                }
                let query = Query {
                    id,
                    name: name.to_string(),
                    rtype: *rtype,
                };
                let encoded = self.codec.encode(&query)?;
                queries.push((query, encoded));
            }

            match self
                .dispatcher
                .submit_multi(channel.socket_id(), channel.socket(), queries, deadline, server)
                .await
            {
                Ok(lookup) => return lookup.await,
                Err(ResolveError::IdCollision) if pass == 0 => {
                    debug!(server = %server, "id collision, re-allocating");
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("submission loop always returns")
    }

    /// Populates the cache from a race outcome before the caller sees it.
    /// A negative outcome caches every queried type so repeats of any of
    /// them stay off the wire.
    fn fill_cache(&self, name: &str, types: &[RecordType], outcome: RaceResult) -> Vec<Record> {
        if outcome.records.is_empty() {
            trace!(name = %name, "caching negative answer");
            for rtype in types {
                self.cache.put(name, *rtype, Vec::new());
            }
            return Vec::new();
        }
        self.cache
            .put(name, outcome.rtype, outcome.records.clone());
        outcome.records
    }
}

fn extract<T>(records: Vec<Record>, select: impl Fn(RecordData) -> Option<T>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| select(record.data))
        .collect()
}

/// Builds the reverse-lookup owner name for an address.
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
                name.push('.');
                name.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
                name.push('.');
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}
