//! Cell registration, delivery and reply correlation
//!
//! The nucleus owns the cell table, the route tables and the pending-reply
//! map. Sends are synchronous handoffs into unbounded per-cell mailboxes, so
//! a sender never blocks on a slow receiver; backpressure is the scheduler's
//! concern, not the kernel's. A background sweeper evicts pending replies
//! whose deadline passed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::envelope::Envelope;
use super::path::LOCAL_DOMAIN;
use super::routing::{Route, RoutingTable};
use super::{Result, RoutingError};

const SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// A message-handling endpoint. Implementations own their state; the nucleus
/// serializes calls per cell.
#[async_trait]
pub trait Cell: Send + 'static {
    async fn message_arrived(&mut self, nucleus: &Nucleus, envelope: Envelope);

    /// Called after the final message, before the cell's task ends. Tunnels
    /// use this to retract routes and close their streams.
    async fn prepare_removal(&mut self, _nucleus: &Nucleus) {}
}

/// Asynchronous reply consumer for sends that must not block.
pub trait ReplyCallback: Send + Sync + 'static {
    fn answer_arrived(&self, envelope: Envelope);
    fn answer_timed_out(&self);
}

enum CellEvent {
    Message(Envelope),
    /// Drain sentinel: everything queued before it is still delivered.
    LastMessage,
}

struct CellHandle {
    tx: mpsc::UnboundedSender<CellEvent>,
}

enum Waiter {
    Oneshot(oneshot::Sender<Envelope>),
    Callback(Arc<dyn ReplyCallback>),
}

struct Pending {
    waiter: Waiter,
    deadline: Instant,
}

struct Inner {
    domain: String,
    cells: RwLock<HashMap<String, CellHandle>>,
    routes: RoutingTable,
    pending: Mutex<HashMap<Uuid, Pending>>,
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
}

/// Handle to the per-process messaging kernel. Cheap to clone.
#[derive(Clone)]
pub struct Nucleus {
    inner: Arc<Inner>,
}

impl Nucleus {
    pub fn new(domain: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            domain: domain.into(),
            cells: RwLock::new(HashMap::new()),
            routes: RoutingTable::new(),
            pending: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        });
        tokio::spawn(sweep_pending(Arc::downgrade(&inner)));
        Nucleus { inner }
    }

    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// Register a cell under a unique name and start its delivery task.
    pub fn register(&self, name: impl Into<String>, cell: impl Cell) -> Result<()> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut cells = self.inner.cells.write().unwrap();
            if cells.contains_key(&name) {
                return Err(RoutingError::DuplicateName(name));
            }
            cells.insert(name.clone(), CellHandle { tx });
        }
        tokio::spawn(run_cell(self.clone(), name, cell, rx));
        Ok(())
    }

    /// Remove a cell. Routes targeting it are retracted first, so routed
    /// senders see no-route rather than a dying mailbox; the name is freed
    /// next, then queued messages drain, `prepare_removal` runs and the task
    /// ends.
    pub fn kill(&self, name: &str) -> Result<()> {
        self.inner.routes.delete_routes_to(name);
        let handle = self
            .inner
            .cells
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| RoutingError::UnknownCell(name.to_string()))?;
        let _ = handle.tx.send(CellEvent::LastMessage);
        Ok(())
    }

    pub fn cell_names(&self) -> Vec<String> {
        self.inner.cells.read().unwrap().keys().cloned().collect()
    }

    pub fn route_add(&self, route: Route) -> Result<()> {
        self.inner.routes.add(route)
    }

    pub fn route_delete(&self, route: &Route) -> Result<()> {
        self.inner.routes.delete(route)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.inner.routes.routes()
    }

    /// Deliver an envelope toward its current destination hop. Local requests
    /// land in the named cell's mailbox; remote ones go to whatever local
    /// cell the route tables name; replies first try the pending map.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if envelope.is_reply() {
            if let Some(pending) = self
                .inner
                .pending
                .lock()
                .unwrap()
                .remove(&envelope.uoid)
            {
                match pending.waiter {
                    Waiter::Oneshot(tx) => {
                        // Receiver gone means the waiter timed out already.
                        let _ = tx.send(envelope);
                    }
                    Waiter::Callback(cb) => cb.answer_arrived(envelope),
                }
                return Ok(());
            }
        }

        let address = envelope.destination.current().clone();
        let local = address.domain == self.inner.domain || address.domain == LOCAL_DOMAIN;
        let target = if local {
            address.cell.clone()
        } else {
            self.inner
                .routes
                .resolve(&address)
                .ok_or_else(|| RoutingError::NoRoute(address.to_string()))?
        };

        let cells = self.inner.cells.read().unwrap();
        match cells.get(&target) {
            Some(handle) => {
                // A closed mailbox means the cell died between lookup and send.
                handle
                    .tx
                    .send(CellEvent::Message(envelope))
                    .map_err(|_| RoutingError::UnknownCell(target.clone()))
            }
            None if envelope.is_reply() => {
                debug!(uoid = %envelope.uoid, "dropping late reply");
                Ok(())
            }
            None => {
                if local {
                    Err(RoutingError::UnknownCell(target))
                } else {
                    Err(RoutingError::NoRoute(address.to_string()))
                }
            }
        }
    }

    /// Advance the destination path one hop and deliver. Used by cells that
    /// sit as explicit intermediates on a path.
    pub fn send_onward(&self, mut envelope: Envelope) -> Result<()> {
        if !envelope.destination.advance() {
            return Err(RoutingError::NoRoute(format!(
                "no hop after {}",
                envelope.destination
            )));
        }
        self.send(envelope)
    }

    /// Send a request and await the correlated reply, bounded by `timeout`.
    pub async fn send_and_wait(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let uoid = envelope.uoid;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(
            uoid,
            Pending {
                waiter: Waiter::Oneshot(tx),
                deadline: Instant::now() + timeout,
            },
        );
        if let Err(err) = self.send(envelope) {
            self.inner.pending.lock().unwrap().remove(&uoid);
            return Err(err);
        }
        rx.await.map_err(|_| RoutingError::Timeout(timeout))
    }

    /// Send a request, delivering the reply (or a timeout) to the callback.
    /// A synchronous routing failure is returned directly and the callback
    /// never fires.
    pub fn send_with_callback(
        &self,
        envelope: Envelope,
        callback: Arc<dyn ReplyCallback>,
        timeout: Duration,
    ) -> Result<()> {
        let uoid = envelope.uoid;
        self.inner.pending.lock().unwrap().insert(
            uoid,
            Pending {
                waiter: Waiter::Callback(callback),
                deadline: Instant::now() + timeout,
            },
        );
        if let Err(err) = self.send(envelope) {
            self.inner.pending.lock().unwrap().remove(&uoid);
            return Err(err);
        }
        Ok(())
    }

    /// Add a local cell to a topic's fan-out list.
    pub fn subscribe(&self, topic: impl Into<String>, cell: impl Into<String>) {
        self.inner
            .subscriptions
            .write()
            .unwrap()
            .entry(topic.into())
            .or_default()
            .push(cell.into());
    }

    /// Deliver a copy of the envelope to every subscriber of the topic.
    /// Subscribers that died since subscribing are skipped.
    pub fn publish(&self, topic: &str, envelope: &Envelope) {
        let subscribers = self
            .inner
            .subscriptions
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let cells = self.inner.cells.read().unwrap();
        for name in subscribers {
            if let Some(handle) = cells.get(&name) {
                let _ = handle.tx.send(CellEvent::Message(envelope.clone()));
            } else {
                debug!(topic, cell = %name, "skipping dead subscriber");
            }
        }
    }
}

async fn run_cell(
    nucleus: Nucleus,
    name: String,
    mut cell: impl Cell,
    mut rx: mpsc::UnboundedReceiver<CellEvent>,
) {
    loop {
        match rx.recv().await {
            Some(CellEvent::Message(envelope)) => {
                cell.message_arrived(&nucleus, envelope).await;
            }
            Some(CellEvent::LastMessage) | None => break,
        }
    }
    debug!(cell = %name, "cell shutting down");
    cell.prepare_removal(&nucleus).await;
}

async fn sweep_pending(inner: Weak<Inner>) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<Pending> = {
            let mut pending = inner.pending.lock().unwrap();
            let dead: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        for entry in expired {
            match entry.waiter {
                // Dropping the sender wakes the waiter with a timeout.
                Waiter::Oneshot(_) => {}
                Waiter::Callback(cb) => cb.answer_timed_out(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::path::{CellAddress, CellPath};
    use crate::messages::Message;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl Cell for Echo {
        async fn message_arrived(&mut self, nucleus: &Nucleus, envelope: Envelope) {
            if matches!(envelope.payload, Message::Ping) {
                let _ = nucleus.send(envelope.into_reply(Message::Pong));
            }
        }
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let nucleus = Nucleus::new("test");
        nucleus.register("echo", Echo).unwrap();

        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("echo@test"),
            Message::Ping,
        );
        let reply = nucleus
            .send_and_wait(envelope, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(reply.payload, Message::Pong));
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let nucleus = Nucleus::new("test");
        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("nobody@test"),
            Message::Ping,
        );
        assert!(matches!(
            nucleus.send(envelope),
            Err(RoutingError::UnknownCell(_))
        ));
    }

    #[tokio::test]
    async fn missing_route_is_an_error() {
        let nucleus = Nucleus::new("test");
        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("cell@elsewhere"),
            Message::Ping,
        );
        assert!(matches!(
            nucleus.send(envelope),
            Err(RoutingError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn wait_times_out_without_reply() {
        struct Silent;

        #[async_trait]
        impl Cell for Silent {
            async fn message_arrived(&mut self, _: &Nucleus, _: Envelope) {}
        }

        let nucleus = Nucleus::new("test");
        nucleus.register("silent", Silent).unwrap();
        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("silent@test"),
            Message::Ping,
        );
        let err = nucleus
            .send_and_wait(envelope, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Timeout(_)));
    }

    struct CountingCallback {
        answered: AtomicU32,
        timed_out: AtomicU32,
    }

    impl CountingCallback {
        fn new() -> Arc<Self> {
            Arc::new(CountingCallback {
                answered: AtomicU32::new(0),
                timed_out: AtomicU32::new(0),
            })
        }
    }

    impl ReplyCallback for CountingCallback {
        fn answer_arrived(&self, _envelope: Envelope) {
            self.answered.fetch_add(1, Ordering::SeqCst);
        }

        fn answer_timed_out(&self) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn callback_gets_the_answer_exactly_once() {
        let nucleus = Nucleus::new("test");
        nucleus.register("echo", Echo).unwrap();

        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("echo@test"),
            Message::Ping,
        );
        let callback = CountingCallback::new();
        nucleus
            .send_with_callback(envelope, callback.clone(), Duration::from_secs(5))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(callback.answered.load(Ordering::SeqCst), 1);
        assert_eq!(callback.timed_out.load(Ordering::SeqCst), 0);

        // Long after the reply the counters must not move again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(callback.answered.load(Ordering::SeqCst), 1);
        assert_eq!(callback.timed_out.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_times_out_exactly_once_without_reply() {
        struct Silent;

        #[async_trait]
        impl Cell for Silent {
            async fn message_arrived(&mut self, _: &Nucleus, _: Envelope) {}
        }

        let nucleus = Nucleus::new("test");
        nucleus.register("silent", Silent).unwrap();

        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("silent@test"),
            Message::Ping,
        );
        let callback = CountingCallback::new();
        nucleus
            .send_with_callback(envelope, callback.clone(), Duration::from_millis(50))
            .unwrap();

        // The sweeper runs every 100ms; give it two chances.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(callback.timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(callback.answered.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(callback.timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(callback.answered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_never_fires_on_synchronous_send_failure() {
        let nucleus = Nucleus::new("test");
        let envelope = Envelope::new(
            CellAddress::new("caller", "test"),
            CellPath::parse("nobody@test"),
            Message::Ping,
        );
        let callback = CountingCallback::new();
        let err = nucleus
            .send_with_callback(envelope, callback.clone(), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnknownCell(_)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(callback.answered.load(Ordering::SeqCst), 0);
        assert_eq!(callback.timed_out.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_cell_name_rejected() {
        let nucleus = Nucleus::new("test");
        nucleus.register("echo", Echo).unwrap();
        assert!(matches!(
            nucleus.register("echo", Echo),
            Err(RoutingError::DuplicateName(_))
        ));
    }
}
