//! Fan-out of fleet events to subscribed listeners.
//!
//! Every listener owns a bounded channel. Publishing never waits: a listener
//! whose channel is full or closed is detached on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::{EventMessage, FleetEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const LISTENER_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct EventFanout {
    listeners: Mutex<HashMap<String, mpsc::Sender<EventMessage>>>,
}

pub type SharedEventFanout = Arc<EventFanout>;

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription_id`, replacing any previous listener of that id.
    pub fn add_listener(&self, subscription_id: &str) -> mpsc::Receiver<EventMessage> {
        let (sender, receiver) = mpsc::channel(LISTENER_CAPACITY);
        let replaced = self
            .listeners
            .lock()
            .insert(subscription_id.to_string(), sender)
            .is_some();
        if replaced {
            info!("Listener {} re-subscribed", subscription_id);
        } else {
            info!("Listener {} subscribed", subscription_id);
        }
        receiver
    }

    /// Returns whether a listener was removed. Unknown ids are ignored.
    pub fn remove_listener(&self, subscription_id: &str) -> bool {
        let removed = self.listeners.lock().remove(subscription_id).is_some();
        if removed {
            info!("Listener {} unsubscribed", subscription_id);
        }
        removed
    }

    /// Detach every listener, ending their streams. Returns how many there were.
    pub fn remove_all_listeners(&self) -> usize {
        let removed = std::mem::take(&mut *self.listeners.lock()).len();
        if removed > 0 {
            info!("Detached {} listeners", removed);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn publish(&self, event: FleetEvent) {
        let message = EventMessage::new(event);
        let mut listeners = self.listeners.lock();
        listeners.retain(|subscription_id, sender| {
            match sender.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Listener {} is not keeping up, detaching", subscription_id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Listener {} went away, detaching", subscription_id);
                    false
                }
            }
        });
        debug!(
            "Published event for station {} to {} listeners",
            message.event.station_id(),
            listeners.len()
        );
    }
}
