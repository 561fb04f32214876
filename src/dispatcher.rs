use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::error::{ResolveError, Result};
use crate::record::{Query, Rcode, Record, RecordType, ServerAddress};
use crate::transport::DatagramSocket;

/// Identifies one registered socket within the dispatcher. Transaction ids
/// are only unique per socket, so the pending table is keyed by both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

type PendingKey = (SocketId, u16);

/// Winning answer of a submission: the type whose response matched and its
/// records. An empty record list is an authoritative negative answer.
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub rtype: RecordType,
    pub records: Vec<Record>,
}

/// One in-flight query. Sibling entries of a multi-type submission share a
/// [`LookupShared`]; the first non-empty answer takes the sink and the rest
/// are cancelled.
struct PendingEntry {
    types_expected: SmallVec<[RecordType; 2]>,
    server: ServerAddress,
    shared: Arc<LookupShared>,
    timer: Mutex<Option<AbortHandle>>,
}

enum EntryOutcome {
    Win(RaceResult),
    Negative(RecordType),
    Failed(ResolveError),
}

struct LookupShared {
    sink: Mutex<Option<oneshot::Sender<Result<RaceResult>>>>,
    /// Sibling entries not yet terminal.
    outstanding: AtomicUsize,
    keys: Mutex<Vec<PendingKey>>,
    /// Set when a sibling ends NXDOMAIN / NoData; the group completes empty
    /// once every sibling is terminal and none produced records.
    negative: Mutex<Option<RecordType>>,
    last_error: Mutex<Option<ResolveError>>,
}

impl LookupShared {
    fn try_complete(&self, result: Result<RaceResult>) -> bool {
        match self.sink.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct DispatcherInner {
    pending: DashMap<PendingKey, PendingEntry>,
    codec: Arc<dyn Codec>,
    next_socket: AtomicU64,
}

impl DispatcherInner {
    /// Deadline expiry for one entry. A no-op if a response already won the
    /// race to remove the key, or if the key has since been reused by a
    /// newer submission.
    fn expire(&self, key: PendingKey, group: &Weak<LookupShared>) {
        let Some(group) = group.upgrade() else {
            return;
        };
        if let Some((_, entry)) = self
            .pending
            .remove_if(&key, |_, entry| Arc::ptr_eq(&entry.shared, &group))
        {
            debug!(id = key.1, server = %entry.server, "query timed out");
            self.finish_entry(entry, EntryOutcome::Failed(ResolveError::Timeout));
        }
    }

    /// Applies a terminal transition to an entry already removed from the
    /// pending table. Exactly one caller can hold the entry, so terminal
    /// transitions happen once.
    fn finish_entry(&self, entry: PendingEntry, outcome: EntryOutcome) {
        if let Some(timer) = entry.timer.lock().take() {
            timer.abort();
        }

        let shared = entry.shared;
        match outcome {
            EntryOutcome::Win(result) => {
                if shared.try_complete(Ok(result)) {
                    self.cancel_entries(&shared);
                }
            }
            EntryOutcome::Negative(rtype) => {
                *shared.negative.lock() = Some(rtype);
                self.sibling_done(&shared);
            }
            EntryOutcome::Failed(err) => {
                *shared.last_error.lock() = Some(err);
                self.sibling_done(&shared);
            }
        }
    }

    fn sibling_done(&self, shared: &Arc<LookupShared>) {
        if shared.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last sibling went terminal without a non-empty answer. An
        // authoritative negative outranks transient sibling errors.
        let result = match shared.negative.lock().take() {
            Some(rtype) => Ok(RaceResult {
                rtype,
                records: Vec::new(),
            }),
            None => Err(shared
                .last_error
                .lock()
                .take()
                .unwrap_or(ResolveError::Timeout)),
        };
        shared.try_complete(result);
    }

    /// Removes every sibling entry of the group from the pending table.
    /// Their responses, if they arrive later, no longer match and are
    /// dropped.
    fn cancel_entries(&self, shared: &LookupShared) {
        let keys = std::mem::take(&mut *shared.keys.lock());
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                if let Some(timer) = entry.timer.lock().take() {
                    timer.abort();
                }
            }
        }
    }
}

/// Owns the pending-query table and matches incoming datagrams back to the
/// submissions that produced them.
#[derive(Clone)]
pub struct QueryDispatcher {
    inner: Arc<DispatcherInner>,
}

impl QueryDispatcher {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                pending: DashMap::new(),
                codec,
                next_socket: AtomicU64::new(0),
            }),
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.inner.codec
    }

    /// Assigns an id to a socket the pool is about to start reading from.
    pub fn register_socket(&self) -> SocketId {
        SocketId(self.inner.next_socket.fetch_add(1, Ordering::Relaxed))
    }

    /// True while `(socket, id)` has an entry in the pending table. Callers
    /// allocating transaction ids use this to skip occupied ids.
    pub fn is_pending(&self, socket: SocketId, id: u16) -> bool {
        self.inner.pending.contains_key(&(socket, id))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Submits a single encoded query. See [`submit_multi`] for the
    /// lifecycle; a single query is a group of one.
    ///
    /// [`submit_multi`]: QueryDispatcher::submit_multi
    pub async fn submit(
        &self,
        socket_id: SocketId,
        socket: &Arc<dyn DatagramSocket>,
        query: Query,
        encoded: Vec<u8>,
        deadline: Instant,
        server: ServerAddress,
    ) -> Result<Lookup> {
        self.submit_multi(socket_id, socket, vec![(query, encoded)], deadline, server)
            .await
    }

    /// Registers one pending entry per query, sends each datagram, and arms
    /// a deadline per entry. All entries share one handle: the first
    /// response with a non-empty matching answer completes it and cancels
    /// the siblings. If every sibling ends negative the handle completes
    /// with an empty list; otherwise the last error surfaces once all
    /// siblings are terminal, so `Timeout` only fires when everything
    /// timed out.
    ///
    /// Fails with `IdCollision` (reserving nothing) if any `(socket, id)`
    /// is already occupied; the caller re-allocates ids and retries once.
    pub async fn submit_multi(
        &self,
        socket_id: SocketId,
        socket: &Arc<dyn DatagramSocket>,
        queries: Vec<(Query, Vec<u8>)>,
        deadline: Instant,
        server: ServerAddress,
    ) -> Result<Lookup> {
        if queries.is_empty() {
            return Err(ResolveError::InvalidArgument(
                "no queries in submission".into(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(LookupShared {
            sink: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(queries.len()),
            keys: Mutex::new(Vec::with_capacity(queries.len())),
            negative: Mutex::new(None),
            last_error: Mutex::new(None),
        });

        // Reserve every id before the first datagram leaves, so a collision
        // aborts the submission without partial sends. The entry guard must
        // drop before cancel_entries touches the table again.
        for (query, _) in &queries {
            let key = (socket_id, query.id);
            let occupied = match self.inner.pending.entry(key) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(PendingEntry {
                        types_expected: SmallVec::from_slice(&[query.rtype]),
                        server,
                        shared: shared.clone(),
                        timer: Mutex::new(None),
                    });
                    false
                }
            };
            if occupied {
                warn!(id = query.id, server = %server, "transaction id collision");
                self.inner.cancel_entries(&shared);
                return Err(ResolveError::IdCollision);
            }
            shared.keys.lock().push(key);
        }

        for (query, encoded) in queries {
            let key = (socket_id, query.id);
            trace!(id = query.id, rtype = %query.rtype, server = %server, "sending query");
            match socket.send(&encoded).await {
                Ok(_) => {
                    let inner = self.inner.clone();
                    let group = Arc::downgrade(&shared);
                    let task = tokio::spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        inner.expire(key, &group);
                    });
                    match self.inner.pending.get(&key) {
                        Some(entry) if Arc::ptr_eq(&entry.shared, &shared) => {
                            *entry.timer.lock() = Some(task.abort_handle());
                        }
                        // A response or cancellation beat us here.
                        _ => task.abort(),
                    }
                }
                Err(e) => {
                    debug!(id = query.id, server = %server, error = %e, "send failed");
                    if let Some((_, entry)) = self.inner.pending.remove(&key) {
                        self.inner.finish_entry(
                            entry,
                            EntryOutcome::Failed(ResolveError::Transport(Arc::new(e))),
                        );
                    }
                }
            }
        }

        Ok(Lookup {
            rx,
            shared,
            inner: self.inner.clone(),
            done: false,
        })
    }

    /// Read-path entry point: decode, match by `(socket, id)`, and resolve
    /// or drop. Malformed and unmatched datagrams are dropped silently.
    pub fn on_receive(&self, socket: SocketId, datagram: &[u8]) {
        let response = match self.inner.codec.decode(datagram) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };

        let key = (socket, response.id);
        let Some((_, entry)) = self.inner.pending.remove(&key) else {
            trace!(id = response.id, "dropping late or spurious response");
            return;
        };

        match response.rcode {
            Rcode::NoError | Rcode::NxDomain => {}
            rcode => {
                debug!(id = response.id, server = %entry.server, %rcode, "server error");
                self.inner
                    .finish_entry(entry, EntryOutcome::Failed(ResolveError::Server(rcode)));
                return;
            }
        }

        if response.truncated {
            debug!(id = response.id, server = %entry.server, "truncated response");
            self.inner
                .finish_entry(entry, EntryOutcome::Failed(ResolveError::Truncated));
            return;
        }

        let records: Vec<Record> = response
            .answers
            .into_iter()
            .filter(|record| entry.types_expected.contains(&record.rtype))
            .collect();

        if let Some(first) = records.first() {
            let rtype = first.rtype;
            trace!(id = response.id, %rtype, count = records.len(), "response matched");
            self.inner
                .finish_entry(entry, EntryOutcome::Win(RaceResult { rtype, records }));
        } else {
            // NXDOMAIN, or NoError with no matching answers (NoData).
            let rtype = entry
                .types_expected
                .first()
                .copied()
                .unwrap_or(RecordType::A);
            trace!(id = response.id, %rtype, "negative response");
            self.inner
                .finish_entry(entry, EntryOutcome::Negative(rtype));
        }
    }

    /// Fails every pending entry bound to a retired socket.
    pub fn fail_socket(&self, socket: SocketId) {
        let keys: Vec<PendingKey> = self
            .inner
            .pending
            .iter()
            .filter(|item| item.key().0 == socket)
            .map(|item| *item.key())
            .collect();

        for key in keys {
            if let Some((_, entry)) = self.inner.pending.remove(&key) {
                debug!(id = key.1, server = %entry.server, "failing entry on retired socket");
                self.inner
                    .finish_entry(entry, EntryOutcome::Failed(ResolveError::ServerRetired));
            }
        }
    }
}

/// Deferred handle for a submission. Resolves once with the race outcome;
/// dropping it before completion cancels every sibling entry, and late
/// datagrams for them are dropped on arrival.
pub struct Lookup {
    rx: oneshot::Receiver<Result<RaceResult>>,
    shared: Arc<LookupShared>,
    inner: Arc<DispatcherInner>,
    done: bool,
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup").field("done", &self.done).finish_non_exhaustive()
    }
}

impl Future for Lookup {
    type Output = Result<RaceResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                Poll::Ready(Err(ResolveError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Lookup {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Completing is no longer possible, entries would only leak.
        self.shared.sink.lock().take();
        self.inner.cancel_entries(&self.shared);
    }
}
