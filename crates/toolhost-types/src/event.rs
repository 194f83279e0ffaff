//! Status notifications emitted to presenters (UI layers, loggers, tests).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a server as tracked by the process manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Events emitted by the orchestration subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    ServerStarted {
        name: String,
    },
    ServerStopped {
        name: String,
    },
    ServerStatusChanged {
        name: String,
        state: ServerState,
        /// Exit code of the process, when it exited on its own.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// True when the process exited without being asked to stop.
        #[serde(default)]
        unexpected: bool,
    },
    ConfigChanged {
        /// Server whose definition changed; `None` for whole-set changes.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolCallResult {
        call_id: String,
        tool: String,
        is_error: bool,
        content: String,
    },
}

impl HostEvent {
    pub fn status(name: impl Into<String>, state: ServerState) -> Self {
        Self::ServerStatusChanged {
            name: name.into(),
            state,
            exit_code: None,
            unexpected: false,
        }
    }
}

/// Cloneable handle to the host's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: HostEvent) {
        tracing::trace!(?event, "host event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_tag() {
        let event = HostEvent::status("echo", ServerState::Running);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "serverStatusChanged");
        assert_eq!(json["state"], "running");
        assert!(json.get("exit_code").is_none());
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(HostEvent::ConfigChanged { name: None });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(HostEvent::ServerStarted {
            name: "fs".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            HostEvent::ServerStarted {
                name: "fs".into()
            }
        );
    }
}
