//! Request/response demultiplexing over one transport.
//!
//! Outgoing calls get ids from a monotonic counter and park in a pending
//! table; a single dispatcher task routes each incoming response back to its
//! waiter and fans notifications out on a bounded broadcast. Two timers guard
//! the table: the per-call deadline owned by the caller's future, and a
//! janitor sweep that expires entries whose timer was somehow lost.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    error::HostError,
    protocol::{Envelope, RequestId, ResponseOutcome},
    transport::StdioTransport,
};

/// Janitor sweep period.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Entries older than this multiple of the default timeout are swept.
const JANITOR_AGE_FACTOR: u32 = 2;
/// Per-subscriber buffer for the notification broadcast. Slow subscribers
/// drop messages; they never block the dispatcher.
const NOTIFICATION_BUFFER: usize = 256;

/// Notification received from the server (an envelope with no id).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Value,
}

enum CallOutcome {
    Result(Value),
    Error(crate::protocol::RpcError),
    Closed,
    Expired(Duration),
}

struct PendingEntry {
    tx: oneshot::Sender<CallOutcome>,
    method: String,
    submitted_at: Instant,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingEntry>>>;

pub(crate) struct RequestMultiplexer {
    server_id: String,
    transport: Arc<StdioTransport>,
    pending: PendingTable,
    next_id: AtomicU64,
    notifications: broadcast::Sender<ServerNotification>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestMultiplexer {
    pub(crate) fn new(
        server_id: &str,
        transport: Arc<StdioTransport>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
        default_timeout: Duration,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);

        let dispatcher = tokio::spawn(dispatch_task(
            server_id.to_string(),
            inbound,
            Arc::clone(&pending),
            notifications.clone(),
        ));
        let janitor = tokio::spawn(janitor_task(
            server_id.to_string(),
            Arc::clone(&pending),
            default_timeout * JANITOR_AGE_FACTOR,
        ));

        Self {
            server_id: server_id.to_string(),
            transport,
            pending,
            next_id: AtomicU64::new(1),
            notifications,
            tasks: Mutex::new(vec![dispatcher, janitor]),
        }
    }

    /// Issues one request and resolves its wire outcome without mapping
    /// server-reported errors into the host taxonomy.
    pub(crate) async fn call_raw(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(RequestId, ResponseOutcome), HostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Insert before writing so a fast response can never miss the table.
        {
            let mut pending = lock(&self.pending);
            pending.insert(
                id,
                PendingEntry {
                    tx,
                    method: method.to_string(),
                    submitted_at: Instant::now(),
                },
            );
        }
        // Removes the entry on every exit from this future, including
        // cancellation by the caller dropping it.
        let _cleanup = PendingCleanup {
            id,
            pending: Arc::clone(&self.pending),
        };

        self.transport
            .send(Envelope::request(id, method, params))?;

        match time::timeout(timeout, rx).await {
            Ok(Ok(CallOutcome::Result(value))) => Ok((id, ResponseOutcome::Result(value))),
            Ok(Ok(CallOutcome::Error(error))) => Ok((id, ResponseOutcome::Error(error))),
            Ok(Ok(CallOutcome::Closed)) => Err(HostError::ConnectionClosed {
                server: self.server_id.clone(),
            }),
            Ok(Ok(CallOutcome::Expired(age))) => Err(HostError::Expired {
                server: self.server_id.clone(),
                method: method.to_string(),
                request_id: id,
                age,
            }),
            Ok(Err(_)) => Err(HostError::ConnectionClosed {
                server: self.server_id.clone(),
            }),
            Err(_) => Err(HostError::Timeout {
                server: self.server_id.clone(),
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Issues one request; a server-reported error becomes [`HostError::Server`].
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, HostError> {
        match self.call_raw(method, params, timeout).await? {
            (_, ResponseOutcome::Result(value)) => Ok(value),
            (_, ResponseOutcome::Error(error)) => Err(HostError::Server {
                server: self.server_id.clone(),
                method: method.to_string(),
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        }
    }

    /// Fire-and-forget write with no id.
    pub(crate) fn notify(&self, method: &str, params: Option<Value>) -> Result<(), HostError> {
        self.transport.send(Envelope::notification(method, params))
    }

    /// Subscribes to the bounded notification broadcast. Late subscribers do
    /// not see past notifications.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ServerNotification> {
        self.notifications.subscribe()
    }

    /// Fails every pending call with `ConnectionClosed` and stops the
    /// dispatcher and janitor.
    pub(crate) fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        fail_all_pending(&self.pending);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

struct PendingCleanup {
    id: RequestId,
    pending: PendingTable,
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

async fn dispatch_task(
    server_id: String,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    pending: PendingTable,
    notifications: broadcast::Sender<ServerNotification>,
) {
    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Envelope::Response { id, outcome } => {
                let entry = lock(&pending).remove(&id);
                match entry {
                    Some(entry) => {
                        let outcome = match outcome {
                            ResponseOutcome::Result(value) => CallOutcome::Result(value),
                            ResponseOutcome::Error(error) => CallOutcome::Error(error),
                        };
                        let _ = entry.tx.send(outcome);
                    }
                    None => {
                        debug!(server = %server_id, id, "discarding response for unknown request id")
                    }
                }
            }
            Envelope::Notification { method, params } => {
                let notification = ServerNotification {
                    method,
                    params: params.unwrap_or(Value::Null),
                };
                if notifications.send(notification).is_err() {
                    debug!(server = %server_id, "no notification subscribers; dropping");
                }
            }
            Envelope::Request { id, method, .. } => {
                warn!(server = %server_id, id, %method, "ignoring unexpected server-to-client request");
            }
        }
    }

    // Inbound stream closed: the child exited or the transport was torn down.
    fail_all_pending(&pending);
}

fn fail_all_pending(pending: &PendingTable) {
    let entries: Vec<PendingEntry> =
        { lock(pending).drain().map(|(_, entry)| entry).collect() };
    for entry in entries {
        let _ = entry.tx.send(CallOutcome::Closed);
    }
}

async fn janitor_task(server_id: String, pending: PendingTable, max_age: Duration) {
    let mut interval = time::interval(JANITOR_INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so sweeps start one period in.
    interval.tick().await;
    loop {
        interval.tick().await;
        sweep_expired(&server_id, &pending, max_age);
    }
}

fn sweep_expired(server_id: &str, pending: &PendingTable, max_age: Duration) -> usize {
    let now = Instant::now();
    let expired: Vec<(RequestId, PendingEntry)> = {
        let mut guard = lock(pending);
        let ids: Vec<RequestId> = guard
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.submitted_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| guard.remove(&id).map(|entry| (id, entry)))
            .collect()
    };

    let swept = expired.len();
    for (id, entry) in expired {
        let age = now.duration_since(entry.submitted_at);
        warn!(
            server = %server_id,
            id,
            method = %entry.method,
            ?age,
            "janitor expired a stale pending request"
        );
        let _ = entry.tx.send(CallOutcome::Expired(age));
    }
    swept
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_submitted(age: Duration) -> (PendingEntry, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            method: "tools/call".into(),
            submitted_at: Instant::now()
                .checked_sub(age)
                .expect("representable instant"),
        };
        (entry, rx)
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_entries() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (stale, mut stale_rx) = entry_submitted(Duration::from_secs(120));
        let (fresh, mut fresh_rx) = entry_submitted(Duration::from_secs(1));
        lock(&pending).insert(1, stale);
        lock(&pending).insert(2, fresh);

        let swept = sweep_expired("test", &pending, Duration::from_secs(60));
        assert_eq!(swept, 1);
        assert_eq!(lock(&pending).len(), 1);
        assert!(matches!(stale_rx.try_recv(), Ok(CallOutcome::Expired(_))));
        assert!(fresh_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_and_empties_the_table() {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (first, mut first_rx) = entry_submitted(Duration::ZERO);
        let (second, mut second_rx) = entry_submitted(Duration::ZERO);
        lock(&pending).insert(1, first);
        lock(&pending).insert(2, second);

        fail_all_pending(&pending);
        assert!(lock(&pending).is_empty());
        assert!(matches!(first_rx.try_recv(), Ok(CallOutcome::Closed)));
        assert!(matches!(second_rx.try_recv(), Ok(CallOutcome::Closed)));
    }
}
