//! Buffer for notifications that arrive while nobody is subscribed.

use std::collections::VecDeque;

use notifier_shared::Notification;

use super::registry::{DeliveryReport, SubscriberRegistry};
use crate::log_warn;

/// FIFO of undelivered notifications, capped by evicting the oldest entry.
#[derive(Debug)]
pub struct NotificationQueue {
    items: VecDeque<Notification>,
    capacity: usize,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append to the tail. Returns the evicted head when the queue was full.
    pub fn enqueue(&mut self, notification: Notification) -> Option<Notification> {
        let evicted = if self.items.len() >= self.capacity {
            let dropped = self.items.pop_front();
            if let Some(dropped) = dropped.as_ref() {
                log_warn!(
                    "Notification queue full ({}), dropping oldest {:?}",
                    self.capacity,
                    dropped.id()
                );
            }
            dropped
        } else {
            None
        };
        self.items.push_back(notification);
        evicted
    }

    /// Deliver every queued notification to `registry` in arrival order, then clear.
    ///
    /// A no-op (returning an empty report) while the registry has no subscribers.
    pub fn drain_into(&mut self, registry: &SubscriberRegistry) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if registry.is_empty() {
            return report;
        }
        while let Some(notification) = self.items.pop_front() {
            report.merge(registry.deliver(&notification));
        }
        report
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }
}
