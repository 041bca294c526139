use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications for code observing the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GateEvent {
    ServerLinked {
        installation_id: String,
        owner_identity: Option<String>,
    },
    ModuleValidated {
        name: String,
        identity: String,
        authorized: bool,
    },
}

const CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.tx.subscribe()
    }

    /// Never blocks; an event with no subscribers is dropped.
    pub fn emit(&self, event: GateEvent) {
        let _ = self.tx.send(event);
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
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(GateEvent::ServerLinked {
            installation_id: "u1".into(),
            owner_identity: None,
        });
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = GateEvent::ModuleValidated {
            name: "Shop".into(),
            identity: "abc".into(),
            authorized: true,
        };
        bus.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn serializes_with_tag() {
        let json = serde_json::to_value(GateEvent::ModuleValidated {
            name: "Shop".into(),
            identity: "abc".into(),
            authorized: false,
        })
        .unwrap();
        assert_eq!(json["event"], "module_validated");
        assert_eq!(json["authorized"], false);
    }
}
