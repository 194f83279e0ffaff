//! Shared types, events and error hierarchy for toolhost.

pub mod error;
pub mod event;
pub mod tool;

pub use error::ConfigError;
pub use event::{EventBus, HostEvent, ServerState};
pub use tool::*;
