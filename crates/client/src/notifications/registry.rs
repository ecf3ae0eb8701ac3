//! The set of callbacks that should receive notifications right now.
//!
//! Removal is debounced. [`SubscriberRegistry::unregister`] only marks an
//! entry `PendingRemoval { deadline }`; the entry keeps receiving
//! notifications until [`SubscriberRegistry::purge_expired`] runs past its
//! deadline. Registering the same callback before then revives it, so a
//! consumer that tears down and immediately re-subscribes never misses a
//! notification.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use notifier_shared::Notification;
use tokio::time::Instant;

use crate::{log_debug, log_error};

/// Consumer callback.
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Notification) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered callback. Identity is the callback allocation itself.
#[derive(Clone)]
pub struct Subscriber(Callback);

impl Subscriber {
    pub fn new(callback: Callback) -> Self {
        Self(callback)
    }

    pub fn same(&self, other: &Subscriber) -> bool {
        // Compare data pointers only; vtable pointers are not unique.
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }

    pub fn callback(&self) -> &Callback {
        &self.0
    }

    fn call(&self, notification: &Notification) -> Result<(), String> {
        catch_unwind(AssertUnwindSafe(|| (self.0)(notification))).map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&str>() {
                format!("callback panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("callback panicked: {s}")
            } else {
                "callback panicked".to_string()
            }
        })
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscriber({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    PendingRemoval { deadline: Instant },
}

#[derive(Debug)]
struct Entry {
    subscriber: Subscriber,
    lifecycle: Lifecycle,
}

/// Outcome of [`SubscriberRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New entry.
    Added,
    /// A pending removal was cancelled.
    Revived,
    /// Already active; nothing changed.
    AlreadyActive,
}

/// Result of fanning one or more notifications out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

#[derive(Debug)]
pub struct SubscriberRegistry {
    entries: Vec<Entry>,
    grace: Duration,
}

impl SubscriberRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Vec::new(),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn register(&mut self, subscriber: Subscriber) -> Registration {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.subscriber.same(&subscriber))
        {
            return match entry.lifecycle {
                Lifecycle::Active => Registration::AlreadyActive,
                Lifecycle::PendingRemoval { .. } => {
                    entry.lifecycle = Lifecycle::Active;
                    log_debug!("Cancelled pending removal of {:?}", subscriber);
                    Registration::Revived
                }
            };
        }
        self.entries.push(Entry {
            subscriber,
            lifecycle: Lifecycle::Active,
        });
        Registration::Added
    }

    /// Schedule removal at `now + grace`. Returns the deadline, or `None` if
    /// the subscriber is unknown.
    ///
    /// Unregistering an entry that is already pending keeps its original deadline.
    pub fn unregister(&mut self, subscriber: &Subscriber, now: Instant) -> Option<Instant> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.subscriber.same(subscriber))?;
        match entry.lifecycle {
            Lifecycle::PendingRemoval { deadline } => Some(deadline),
            Lifecycle::Active => {
                let deadline = now + self.grace;
                entry.lifecycle = Lifecycle::PendingRemoval { deadline };
                Some(deadline)
            }
        }
    }

    /// Physically remove entries whose grace window ended at or before `now`.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| match e.lifecycle {
            Lifecycle::Active => true,
            Lifecycle::PendingRemoval { deadline } => deadline > now,
        });
        before - self.entries.len()
    }

    /// Earliest pending removal deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| match e.lifecycle {
                Lifecycle::PendingRemoval { deadline } => Some(deadline),
                Lifecycle::Active => None,
            })
            .min()
    }

    /// Invoke every entry, pending ones included, with `notification`.
    ///
    /// A panicking callback is logged and counted; the rest still run.
    pub fn deliver(&self, notification: &Notification) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for entry in &self.entries {
            match entry.subscriber.call(notification) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    report.failed += 1;
                    log_error!(
                        "Subscriber {:?} failed on notification {:?}: {}",
                        entry.subscriber,
                        notification.id(),
                        reason
                    );
                }
            }
        }
        report
    }

    /// True iff nobody is registered. Pending removals still count.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
