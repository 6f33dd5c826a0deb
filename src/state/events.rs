//! Broadcast channel notifying callback-id subscribers of per-device state
//! changes (spec §3 "callback id to notify on state change").

use tokio::sync::broadcast;

use crate::session::DeviceState;
use crate::types::AirPlayDevice;

/// Coarse error classification carried on [`SessionEvent::Error`],
/// mirroring [`crate::error::ErrorKind`] but decoupled from it so a
/// callback subscriber need not depend on the error type directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Connection or I/O failure.
    Network,
    /// Pairing or digest-auth failure.
    Authentication,
    /// Malformed or unexpected RTSP/plist response.
    Protocol,
    /// Audio pipeline failure (encode/encrypt/send).
    Playback,
    /// Anything not covered above.
    Unknown,
}

/// Notifications the backend emits for a device's registered callback id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session transitioned to a new protocol state.
    StateChanged {
        /// Callback id this event targets.
        callback_id: u64,
        /// State before the transition.
        old: DeviceState,
        /// State after the transition.
        new: DeviceState,
    },
    /// A device requires PIN authorization before pairing can proceed
    /// (403 on OPTIONS, or 470 on a transient pair-setup step).
    AuthRequired {
        /// Callback id this event targets.
        callback_id: u64,
        /// The device that requires a PIN.
        device: AirPlayDevice,
    },
    /// A stored key or password was rejected.
    AuthRejected {
        /// Callback id this event targets.
        callback_id: u64,
    },
    /// A retransmit request went unanswered past its window, or a
    /// retransmit lookup missed the ring.
    RetransmitMiss {
        /// Callback id this event targets.
        callback_id: u64,
        /// RTP sequence number that could not be served.
        sequence: u16,
    },
    /// A session-level error occurred.
    Error {
        /// Callback id this event targets.
        callback_id: u64,
        /// Coarse classification.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl SessionEvent {
    /// The callback id every variant carries.
    #[must_use]
    pub fn callback_id(&self) -> u64 {
        match self {
            Self::StateChanged { callback_id, .. }
            | Self::AuthRequired { callback_id, .. }
            | Self::AuthRejected { callback_id }
            | Self::RetransmitMiss { callback_id, .. }
            | Self::Error { callback_id, .. } => *callback_id,
        }
    }
}

/// Broadcasts [`SessionEvent`]s to every interested subscriber.
///
/// Capacity 100: a slow subscriber that falls behind more than 100 events
/// drops the oldest ones on its next `recv` (tokio broadcast semantics) —
/// acceptable here since every event also updates durable session state
/// a subscriber can re-read on reconnect.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver scoped to one callback id.
pub struct EventFilter {
    rx: broadcast::Receiver<SessionEvent>,
    callback_id: u64,
}

impl EventFilter {
    /// Create a filtered receiver that only yields events for
    /// `callback_id`.
    #[must_use]
    pub fn for_callback(bus: &EventBus, callback_id: u64) -> Self {
        Self {
            rx: bus.subscribe(),
            callback_id,
        }
    }

    /// Receive the next event addressed to this filter's callback id.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.callback_id() == self.callback_id => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn device() -> AirPlayDevice {
        AirPlayDevice {
            id: "id".into(),
            name: "name".into(),
            model: None,
            addresses: vec!["127.0.0.1".parse().unwrap()],
            port: 7000,
            capabilities: crate::types::DeviceCapabilities::default(),
            txt_records: HashMap::new(),
            requires_auth: false,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::AuthRejected { callback_id: 1 });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::AuthRejected { callback_id: 1 }));
    }

    #[tokio::test]
    async fn filter_ignores_events_for_other_callback_ids() {
        let bus = EventBus::new();
        let mut filter = EventFilter::for_callback(&bus, 2);
        bus.emit(SessionEvent::AuthRejected { callback_id: 1 });
        bus.emit(SessionEvent::AuthRequired {
            callback_id: 2,
            device: device(),
        });
        let event = filter.recv().await.unwrap();
        assert_eq!(event.callback_id(), 2);
    }

    #[tokio::test]
    async fn state_changed_carries_old_and_new() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::StateChanged {
            callback_id: 3,
            old: DeviceState::Setup,
            new: DeviceState::Record,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            SessionEvent::StateChanged { old: DeviceState::Setup, new: DeviceState::Record, .. }
        ));
    }
}
