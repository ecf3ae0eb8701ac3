//! Notification fan-out: subscribers, the offline queue, the last-seen
//! marker, and the dispatch loop tying them together.

pub mod dispatch;
pub mod queue;
pub mod registry;
pub mod tracker;

pub use dispatch::{DispatchHandle, DispatchStats, Dispatcher};
pub use queue::NotificationQueue;
pub use registry::{callback, Callback, DeliveryReport, Registration, Subscriber, SubscriberRegistry};
pub use tracker::{marker_key, MissedMessageTracker, MARKER_KEY};
