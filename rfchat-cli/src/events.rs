//! Caller-facing events. Everything the session reports flows through one
//! ordered channel that the presentation layer drains on its own schedule.

use rfchat_core::{DeviceId, DeviceListChange, DiscoveredDevice, Role, StopCause};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    DeviceAdded(DiscoveredDevice),
    DeviceUpdated(DiscoveredDevice),
    DeviceRemoved(DeviceId),
    EnumerationCompleted { count: usize },
    /// Watcher stopped; the visible device set is now empty.
    DiscoveryStopped,
    Connected {
        role: Role,
        peer_name: String,
        service_name: String,
    },
    MessageReceived(String),
    MessageSent(String),
    /// The peer went away under an active connection. Teardown follows
    /// only when the fault came from the receive loop.
    PeerDisconnected(String),
    /// Resources were released; carries the teardown reason.
    Disconnected(String),
    /// The receive loop ended without an error to report. Informational.
    ReceiveStopped(StopCause),
}

impl From<DeviceListChange> for ChatEvent {
    fn from(change: DeviceListChange) -> Self {
        match change {
            DeviceListChange::Added(d) => ChatEvent::DeviceAdded(d),
            DeviceListChange::Updated(d) => ChatEvent::DeviceUpdated(d),
            DeviceListChange::Removed(id) => ChatEvent::DeviceRemoved(id),
            DeviceListChange::EnumerationCompleted { count } => {
                ChatEvent::EnumerationCompleted { count }
            }
            DeviceListChange::Cleared => ChatEvent::DiscoveryStopped,
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Sending half of the event channel. Cloned into every background task.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<ChatEvent>);

impl EventSender {
    pub fn channel() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender(tx), rx)
    }

    /// Emit one event. A dropped receiver means nobody is listening; that is not an error.
    pub fn emit(&self, event: ChatEvent) {
        tracing::trace!(?event, "event");
        let _ = self.0.send(event);
    }
}
