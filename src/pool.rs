use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::Codec;
use crate::constants::MAX_DATAGRAM_BYTES;
use crate::dispatcher::{QueryDispatcher, SocketId};
use crate::error::Result;
use crate::record::{Query, RecordType, ServerAddress};
use crate::transport::{DatagramSocket, SocketFactory};
use crate::txid::TxidAllocator;

/// Health bookkeeping for one upstream address. Survives channel retirement
/// so failure history carries across reopen.
#[derive(Debug, Default)]
struct ServerHealth {
    consecutive_failures: AtomicU32,
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
}

/// Point-in-time view of a server's health counters.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub consecutive_failures: u32,
}

/// A live channel to one server: the connected socket plus the task that
/// drains it into the dispatcher.
pub struct Channel {
    socket_id: SocketId,
    socket: Arc<dyn DatagramSocket>,
    reader: JoinHandle<()>,
    last_used: Mutex<Instant>,
    in_flight: AtomicU32,
}

impl Channel {
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn socket(&self) -> &Arc<dyn DatagramSocket> {
        &self.socket
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    fn mark_used(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Counts a request against this channel until the guard drops.
    pub fn begin_flight(self: &Arc<Self>) -> FlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        FlightGuard {
            channel: self.clone(),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The read loop holds the socket, not the channel; stop it when the
        // last handle goes away.
        self.reader.abort();
    }
}

pub struct FlightGuard {
    channel: Arc<Channel>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.channel.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Ordered list of upstream resolver addresses plus the lazily-opened
/// channel for each. Channels are kept alive across queries; a server that
/// keeps failing has its channel retired and reopened on next use.
pub struct ServerPool {
    servers: RwLock<Vec<ServerAddress>>,
    channels: DashMap<ServerAddress, Arc<Channel>>,
    health: DashMap<ServerAddress, Arc<ServerHealth>>,
    factory: Arc<dyn SocketFactory>,
    dispatcher: QueryDispatcher,
    txid: Arc<TxidAllocator>,
    max_failures: u32,
}

impl ServerPool {
    pub fn new(
        servers: Vec<ServerAddress>,
        factory: Arc<dyn SocketFactory>,
        dispatcher: QueryDispatcher,
        txid: Arc<TxidAllocator>,
        max_failures: u32,
    ) -> Self {
        Self {
            servers: RwLock::new(servers),
            channels: DashMap::new(),
            health: DashMap::new(),
            factory,
            dispatcher,
            txid,
            max_failures,
        }
    }

    /// Appends a server unless already present.
    pub fn add(&self, addr: ServerAddress) -> bool {
        let mut servers = self.servers.write();
        if servers.contains(&addr) {
            return false;
        }
        servers.push(addr);
        info!(server = %addr, "added upstream server");
        true
    }

    /// Removes a server from the list and retires its channel.
    pub fn remove(&self, addr: ServerAddress) -> bool {
        let removed = {
            let mut servers = self.servers.write();
            let before = servers.len();
            servers.retain(|s| *s != addr);
            servers.len() != before
        };
        if removed {
            self.retire(addr);
            info!(server = %addr, "removed upstream server");
        }
        removed
    }

    pub fn get(&self, index: usize) -> Option<ServerAddress> {
        self.servers.read().get(index).copied()
    }

    /// First server in the configured order.
    pub fn primary(&self) -> Option<ServerAddress> {
        self.servers.read().first().copied()
    }

    /// Consistent snapshot of the server list.
    pub fn servers(&self) -> Vec<ServerAddress> {
        self.servers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// True while a channel to the address is open.
    pub fn is_open(&self, addr: ServerAddress) -> bool {
        self.channels.contains_key(&addr)
    }

    /// Returns the channel for the address, opening one if absent.
    ///
    /// Creation is double-checked: the socket is opened outside the map
    /// lock, and a concurrent opener losing the insert race drops its
    /// socket and uses the winner's channel.
    pub async fn socket_for(&self, addr: ServerAddress) -> Result<Arc<Channel>> {
        if let Some(channel) = self.channels.get(&addr) {
            channel.mark_used();
            return Ok(channel.clone());
        }

        let socket = self.factory.connect(addr.socket_addr()).await?;
        match self.channels.entry(addr) {
            Entry::Occupied(existing) => {
                let channel = existing.get().clone();
                channel.mark_used();
                Ok(channel)
            }
            Entry::Vacant(slot) => {
                let socket_id = self.dispatcher.register_socket();
                let reader = spawn_reader(socket.clone(), self.dispatcher.clone(), socket_id, addr);
                let channel = Arc::new(Channel {
                    socket_id,
                    socket,
                    reader,
                    last_used: Mutex::new(Instant::now()),
                    in_flight: AtomicU32::new(0),
                });
                slot.insert(channel.clone());
                debug!(server = %addr, "opened channel");
                Ok(channel)
            }
        }
    }

    /// Closes the channel to the address and fails its in-flight queries
    /// with `ServerRetired`. The address stays in the server list.
    pub fn retire(&self, addr: ServerAddress) -> bool {
        let Some((_, channel)) = self.channels.remove(&addr) else {
            return false;
        };
        channel.reader.abort();
        self.dispatcher.fail_socket(channel.socket_id);
        info!(server = %addr, "retired channel");
        true
    }

    /// Retires channels that have been idle longer than `max_idle`.
    pub fn retire_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<ServerAddress> = self
            .channels
            .iter()
            .filter(|item| item.value().idle_for() > max_idle && item.value().in_flight() == 0)
            .map(|item| *item.key())
            .collect();
        let count = idle.len();
        for addr in idle {
            self.retire(addr);
        }
        count
    }

    fn health_for(&self, addr: ServerAddress) -> Arc<ServerHealth> {
        self.health
            .entry(addr)
            .or_insert_with(|| Arc::new(ServerHealth::default()))
            .clone()
    }

    pub fn record_success(&self, addr: ServerAddress) {
        let health = self.health_for(addr);
        health.consecutive_failures.store(0, Ordering::Relaxed);
        health.total_requests.fetch_add(1, Ordering::Relaxed);
        health.successful_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed attempt; at `max_failures` consecutive failures the
    /// channel is retired. The next request to the address reopens it.
    pub fn record_failure(&self, addr: ServerAddress) {
        let health = self.health_for(addr);
        health.total_requests.fetch_add(1, Ordering::Relaxed);
        let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        if failures >= self.max_failures {
            warn!(server = %addr, failures, "server keeps failing, retiring channel");
            health.consecutive_failures.store(0, Ordering::Relaxed);
            self.retire(addr);
        }
    }

    pub fn stats(&self, addr: ServerAddress) -> Option<ServerStats> {
        self.health.get(&addr).map(|health| ServerStats {
            total_requests: health.total_requests.load(Ordering::Relaxed),
            successful_responses: health.successful_responses.load(Ordering::Relaxed),
            consecutive_failures: health.consecutive_failures.load(Ordering::Relaxed),
        })
    }

    pub fn all_stats(&self) -> Vec<(ServerAddress, ServerStats)> {
        self.servers()
            .into_iter()
            .filter_map(|addr| self.stats(addr).map(|stats| (addr, stats)))
            .collect()
    }

    /// Issues an A-record lookup for the canary name against the address
    /// and reports whether any answer came back before the deadline. Used
    /// at bootstrap to filter unreachable OS-supplied servers.
    pub async fn validate(&self, addr: ServerAddress, canary: &str, timeout: Duration) -> bool {
        let channel = match self.socket_for(addr).await {
            Ok(channel) => channel,
            Err(e) => {
                debug!(server = %addr, error = %e, "validation could not open channel");
                return false;
            }
        };

        let query = Query {
            id: self.txid.next(),
            name: canary.to_string(),
            rtype: RecordType::A,
        };
        let encoded = match self.dispatcher.codec().encode(&query) {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!(server = %addr, error = %e, "validation could not encode canary");
                return false;
            }
        };

        let deadline = Instant::now() + timeout;
        let lookup = match self
            .dispatcher
            .submit(channel.socket_id(), channel.socket(), query, encoded, deadline, addr)
            .await
        {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(server = %addr, error = %e, "validation submit failed");
                return false;
            }
        };

        match lookup.await {
            Ok(_) => {
                debug!(server = %addr, "validation succeeded");
                true
            }
            Err(e) => {
                debug!(server = %addr, error = %e, "validation failed");
                false
            }
        }
    }

    /// Blocking form of [`validate`](ServerPool::validate) for bootstrap
    /// callers. The async validation is driven on a dedicated worker
    /// thread and the calling thread blocks on a completion channel, so
    /// the socket read loops are never stalled. The worker reuses the
    /// ambient runtime when one exists; otherwise it drives a throwaway
    /// runtime and retires the channel afterwards, since its read loop
    /// dies with that runtime.
    ///
    /// Callers already on a single-threaded runtime should use the async
    /// form instead; blocking the only worker would stall the validation
    /// itself.
    pub fn validate_blocking(
        self: &Arc<Self>,
        addr: ServerAddress,
        canary: &str,
        timeout: Duration,
    ) -> bool {
        let pool = Arc::clone(self);
        let canary = canary.to_string();
        let handle = Handle::try_current().ok();
        let (tx, rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("hugin-validate".to_string())
            .spawn(move || {
                let ok = match handle {
                    Some(handle) => handle.block_on(pool.validate(addr, &canary, timeout)),
                    None => match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => {
                            let ok = runtime.block_on(pool.validate(addr, &canary, timeout));
                            // The channel's read loop ran on the throwaway
                            // runtime; retire it so the next use reopens.
                            pool.retire(addr);
                            ok
                        }
                        Err(e) => {
                            warn!(error = %e, "could not build validation runtime");
                            false
                        }
                    },
                };
                let _ = tx.send(ok);
            });

        match worker {
            Ok(_) => rx.recv().unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "could not spawn validation worker");
                false
            }
        }
    }
}

fn spawn_reader(
    socket: Arc<dyn DatagramSocket>,
    dispatcher: QueryDispatcher,
    socket_id: SocketId,
    addr: ServerAddress,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM_BYTES);
        loop {
            match socket.recv(&mut buf).await {
                Ok(len) => {
                    trace!(server = %addr, len, "datagram received");
                    dispatcher.on_receive(socket_id, &buf[..len]);
                }
                Err(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::Interrupted
                ) =>
                {
                    // ICMP unreachable surfaces here on connected UDP.
                    debug!(server = %addr, error = %e, "transient recv error on channel");
                }
                Err(e) => {
                    debug!(server = %addr, error = %e, "channel read loop stopped");
                    break;
                }
            }
        }
    })
}
