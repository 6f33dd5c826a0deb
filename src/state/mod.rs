//! Cross-session event distribution.

mod events;

pub use events::{ErrorCode, EventFilter, SessionEvent};
pub use events::EventBus;
