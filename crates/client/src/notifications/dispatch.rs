//! The single writer of the registry, the queue and the last-seen marker.
//!
//! [`Dispatcher`] holds the algorithm; [`spawn`] runs it as an actor task so
//! that inbound notifications, subscribe/unsubscribe and connection events are
//! applied strictly in the order they were submitted, without locks. Callbacks
//! run on the actor task and must not block.

use std::ops::ControlFlow;
use std::time::Duration;

use notifier_shared::Notification;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::queue::NotificationQueue;
use super::registry::{DeliveryReport, Registration, Subscriber, SubscriberRegistry};
use super::tracker::MissedMessageTracker;
use crate::ws::WsHandle;
use crate::{log_debug, log_info};

/// Point-in-time view of the dispatch state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub subscribers: usize,
    pub queued: usize,
    pub last_seen: Option<String>,
}

pub struct Dispatcher {
    registry: SubscriberRegistry,
    queue: NotificationQueue,
    tracker: MissedMessageTracker,
}

impl Dispatcher {
    pub fn new(
        registry: SubscriberRegistry,
        queue: NotificationQueue,
        tracker: MissedMessageTracker,
    ) -> Self {
        Self {
            registry,
            queue,
            tracker,
        }
    }

    /// Record, then deliver or buffer one inbound notification.
    pub fn process(&mut self, notification: Notification) -> DeliveryReport {
        self.tracker.record_seen(&notification);
        if self.registry.is_empty() {
            log_debug!("No subscribers, queueing {:?}", notification.id());
            self.queue.enqueue(notification);
            DeliveryReport::default()
        } else {
            self.registry.deliver(&notification)
        }
    }

    /// Register and hand over anything queued before the subscriber joined.
    pub fn register(&mut self, subscriber: Subscriber) -> Registration {
        let registration = self.registry.register(subscriber);
        let drained = self.queue.drain_into(&self.registry);
        if drained.delivered + drained.failed > 0 {
            log_debug!("Drained queued notifications to new subscriber: {:?}", drained);
        }
        registration
    }

    pub fn unregister(&mut self, subscriber: &Subscriber, now: Instant) -> Option<Instant> {
        self.registry.unregister(subscriber, now)
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        self.registry.purge_expired(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    /// A connection came up: ask for the backlog, then flush the queue.
    pub fn connected(&mut self, handle: &WsHandle) -> DeliveryReport {
        self.tracker.request_backlog(handle);
        self.queue.drain_into(&self.registry)
    }

    pub fn set_scope(&mut self, key: String) {
        self.tracker.set_scope(key);
    }

    /// Forget every subscriber and every queued notification.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.queue.clear();
    }

    /// Persist the last-seen marker if it moved.
    pub fn flush(&mut self) {
        self.tracker.flush();
    }

    /// Apply one command at `now`. Removals whose grace ended by `now` take
    /// effect first, so an expired subscriber never sees the command.
    fn handle(&mut self, cmd: DispatchCmd, now: Instant) -> ControlFlow<()> {
        let removed = self.purge_expired(now);
        if removed > 0 {
            log_debug!("Removed {} unsubscribed callback(s)", removed);
        }
        match cmd {
            DispatchCmd::Inbound(notification) => {
                self.process(notification);
            }
            DispatchCmd::Register(subscriber) => {
                self.register(subscriber);
            }
            DispatchCmd::Unregister(subscriber) => {
                self.unregister(&subscriber, now);
            }
            DispatchCmd::Connected(handle) => {
                self.connected(&handle);
            }
            DispatchCmd::SetScope(key) => self.set_scope(key),
            DispatchCmd::Clear => self.clear(),
            DispatchCmd::Stats(result_tx) => {
                let _ = result_tx.send(self.stats());
            }
            DispatchCmd::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            subscribers: self.registry.len(),
            queued: self.queue.len(),
            last_seen: self.tracker.last_seen().map(str::to_string),
        }
    }
}

enum DispatchCmd {
    Inbound(Notification),
    Register(Subscriber),
    Unregister(Subscriber),
    Connected(WsHandle),
    SetScope(String),
    Clear,
    Stats(oneshot::Sender<DispatchStats>),
    Shutdown,
}

/// Cloneable sender into the dispatch loop. Every method is non-blocking;
/// commands sent after the loop stopped are dropped.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<DispatchCmd>,
}

impl DispatchHandle {
    pub fn inbound(&self, notification: Notification) {
        let _ = self.tx.send(DispatchCmd::Inbound(notification));
    }

    pub fn register(&self, subscriber: Subscriber) {
        let _ = self.tx.send(DispatchCmd::Register(subscriber));
    }

    pub fn unregister(&self, subscriber: Subscriber) {
        let _ = self.tx.send(DispatchCmd::Unregister(subscriber));
    }

    pub fn connected(&self, handle: WsHandle) {
        let _ = self.tx.send(DispatchCmd::Connected(handle));
    }

    pub fn set_scope(&self, key: String) {
        let _ = self.tx.send(DispatchCmd::SetScope(key));
    }

    pub fn clear(&self) {
        let _ = self.tx.send(DispatchCmd::Clear);
    }

    /// Snapshot taken after every previously sent command has been applied.
    pub async fn stats(&self) -> DispatchStats {
        let (result_tx, result_rx) = oneshot::channel();
        if self.tx.send(DispatchCmd::Stats(result_tx)).is_err() {
            return DispatchStats::default();
        }
        result_rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DispatchCmd::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

// Far-future instant used when no removal is pending.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// Start the dispatch loop on the current tokio runtime.
pub fn spawn(dispatcher: Dispatcher) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(dispatcher, rx));
    (DispatchHandle { tx }, task)
}

// Commands applied before the marker is flushed to storage.
const MAX_BATCH: usize = 64;

async fn run(mut dispatcher: Dispatcher, mut rx: mpsc::UnboundedReceiver<DispatchCmd>) {
    'run: loop {
        let wake_at = dispatcher
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        tokio::select! {
            biased;
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break 'run };
                let mut next = Some(cmd);
                let mut applied = 0;
                while let Some(cmd) = next.take() {
                    if dispatcher.handle(cmd, Instant::now()).is_break() {
                        break 'run;
                    }
                    applied += 1;
                    if applied < MAX_BATCH {
                        next = rx.try_recv().ok();
                    }
                }
                dispatcher.flush();
            }
            _ = tokio::time::sleep_until(wake_at) => {
                let removed = dispatcher.purge_expired(Instant::now());
                if removed > 0 {
                    log_debug!("Removed {} unsubscribed callback(s)", removed);
                }
            }
        }
    }
    dispatcher.flush();
    log_info!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::registry::callback;
    use crate::notifications::tracker::MARKER_KEY;
    use crate::storage::{MarkerStore, MemoryStore};
    use futures_channel::mpsc::unbounded;
    use notifier_shared::ClientCommand;
    use std::sync::{Arc, Mutex};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            SubscriberRegistry::new(Duration::from_secs(2)),
            NotificationQueue::new(100),
            MissedMessageTracker::new(Arc::new(MemoryStore::new()), MARKER_KEY),
        )
    }

    fn recorder() -> (Subscriber, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = Subscriber::new(callback(move |n: &Notification| {
            sink.lock().unwrap().push(n.id().unwrap_or_default().to_string());
        }));
        (sub, seen)
    }

    #[test]
    fn queued_notifications_reach_first_subscriber_in_order() {
        let mut d = dispatcher();
        d.process(Notification::new("n1"));
        d.process(Notification::new("n2"));
        assert_eq!(d.stats().queued, 2);

        let (sub, seen) = recorder();
        d.register(sub);
        d.process(Notification::new("n3"));

        assert_eq!(*seen.lock().unwrap(), vec!["n1", "n2", "n3"]);
        assert_eq!(d.stats().queued, 0);
        assert_eq!(d.stats().last_seen.as_deref(), Some("n3"));
    }

    #[test]
    fn second_subscriber_does_not_replay() {
        let mut d = dispatcher();
        d.process(Notification::new("n1"));

        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        d.register(first);
        d.register(second);
        d.process(Notification::new("n2"));

        assert_eq!(*first_seen.lock().unwrap(), vec!["n1", "n2"]);
        assert_eq!(*second_seen.lock().unwrap(), vec!["n2"]);
    }

    #[test]
    fn queueing_resumes_after_last_subscriber_is_purged() {
        let mut d = dispatcher();
        let (sub, seen) = recorder();
        let start = Instant::now();

        d.register(sub.clone());
        d.unregister(&sub, start);
        d.process(Notification::new("grace"));
        d.purge_expired(start + Duration::from_secs(2));
        d.process(Notification::new("queued"));

        assert_eq!(*seen.lock().unwrap(), vec!["grace"]);
        assert_eq!(d.stats().queued, 1);
    }

    #[test]
    fn expired_subscriber_misses_commands_after_its_deadline() {
        let mut d = dispatcher();
        let (sub, seen) = recorder();
        let start = Instant::now();

        let _ = d.handle(DispatchCmd::Register(sub.clone()), start);
        let _ = d.handle(DispatchCmd::Unregister(sub), start);
        let _ = d.handle(
            DispatchCmd::Inbound(Notification::new("n1")),
            start + Duration::from_millis(1999),
        );
        let _ = d.handle(
            DispatchCmd::Inbound(Notification::new("n2")),
            start + Duration::from_secs(2),
        );

        assert_eq!(*seen.lock().unwrap(), vec!["n1"]);
        let stats = d.stats();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.queued, 1);
    }

    #[test]
    fn shutdown_stops_handling() {
        let mut d = dispatcher();
        assert!(d.handle(DispatchCmd::Shutdown, Instant::now()).is_break());
        assert!(d.handle(DispatchCmd::Clear, Instant::now()).is_continue());
    }

    #[test]
    fn connected_requests_backlog_then_drains() {
        let mut d = dispatcher();
        d.process(Notification::new("n10"));
        let (tx, mut rx) = unbounded();

        let report = d.connected(&WsHandle::new(tx));
        assert_eq!(report.delivered, 0);
        assert_eq!(d.stats().queued, 1);

        let sent = rx.try_next().unwrap().unwrap();
        assert_eq!(
            sent.payload,
            ClientCommand::FetchMissedNotifications {
                last_seen_id: "n10".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_purges_after_grace() {
        let (handle, task) = spawn(dispatcher());
        let (sub, seen) = recorder();

        handle.register(sub.clone());
        handle.unregister(sub);
        assert_eq!(handle.stats().await.subscribers, 1);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(handle.stats().await.subscribers, 0);

        handle.inbound(Notification::new("late"));
        assert_eq!(handle.stats().await.queued, 1);
        assert!(seen.lock().unwrap().is_empty());

        handle.shutdown();
        task.await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn loop_persists_marker_after_each_batch() {
        let store = Arc::new(MemoryStore::new());
        let (handle, task) = spawn(Dispatcher::new(
            SubscriberRegistry::new(Duration::from_secs(2)),
            NotificationQueue::new(100),
            MissedMessageTracker::new(store.clone(), MARKER_KEY),
        ));

        handle.inbound(Notification::new("n1"));
        handle.inbound(Notification::new("n2"));
        assert_eq!(handle.stats().await.last_seen.as_deref(), Some("n2"));

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(store.get(MARKER_KEY).as_deref(), Some("n2"));
    }
}
