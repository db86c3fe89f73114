//! Event Bus: synchronous publish/subscribe
//!
//! Two channels are offered: threat events and state transitions. Delivery
//! happens inline, in the caller's context, in subscriber registration order.
//! The subscriber list is snapshotted before delivery so callbacks may
//! subscribe or unsubscribe without deadlocking the bus.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::event::ThreatEvent;
use crate::state::StateTransition;

/// Callback invoked for every published threat event
pub type ThreatCallback = Arc<dyn Fn(&ThreatEvent) + Send + Sync>;

/// Callback invoked for every state transition
pub type StateCallback = Arc<dyn Fn(&StateTransition) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Threat,
    State,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    threat_subscribers: Mutex<Vec<(u64, ThreatCallback)>>,
    state_subscribers: Mutex<Vec<(u64, StateCallback)>>,
}

/// Publish/subscribe register shared by every producer of the shield
///
/// Cloning yields another handle to the same subscriber lists.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("threat_subscribers", &self.threat_subscriber_count())
            .field("state_subscribers", &self.state_subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_threat_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ThreatEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .threat_subscribers
            .lock()
            .push((id, Arc::new(callback)));
        self.subscription(id, Channel::Threat)
    }

    pub fn subscribe_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .state_subscribers
            .lock()
            .push((id, Arc::new(callback)));
        self.subscription(id, Channel::State)
    }

    /// Deliver a threat event to every subscriber
    pub fn publish_threat(&self, event: &ThreatEvent) {
        let subscribers: Vec<ThreatCallback> = self
            .inner
            .threat_subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in subscribers {
            callback(event);
        }
    }

    /// Deliver a state transition to every subscriber
    pub fn publish_state_change(&self, transition: &StateTransition) {
        let subscribers: Vec<StateCallback> = self
            .inner
            .state_subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in subscribers {
            callback(transition);
        }
    }

    /// Drop every subscriber on both channels
    pub fn clear(&self) {
        self.inner.threat_subscribers.lock().clear();
        self.inner.state_subscribers.lock().clear();
    }

    pub fn threat_subscriber_count(&self) -> usize {
        self.inner.threat_subscribers.lock().len()
    }

    pub fn state_subscriber_count(&self) -> usize {
        self.inner.state_subscribers.lock().len()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscription(&self, id: u64, channel: Channel) -> Subscription {
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            channel,
            active: AtomicBool::new(true),
        }
    }
}

/// Handle returned by a subscribe call
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing twice is a no-op.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
    channel: Channel,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Returns true only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        match self.channel {
            Channel::Threat => {
                let mut subs = inner.threat_subscribers.lock();
                let before = subs.len();
                subs.retain(|(id, _)| *id != self.id);
                subs.len() != before
            }
            Channel::State => {
                let mut subs = inner.state_subscribers.lock();
                let before = subs.len();
                subs.retain(|(id, _)| *id != self.id);
                subs.len() != before
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}
