//! Session activity events.
//!
//! Every session owns one [`EventEmitter`]. Subscribers receive a
//! [`SessionEvent`] for each agent connection, endpoint transition and
//! lifecycle change, stamped with the session id and the time it happened.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Activity {
    /// The command channel to the agent is up
    AgentConnected { peer: String },

    /// TAP created and parked in the root namespace
    EndpointProvisioned { endpoint: String, bridge: usize },

    /// TAP moved into its host and addressed
    EndpointMigrated {
        endpoint: String,
        host: String,
        address: Option<String>,
    },

    /// A migration step failed and the applied steps were undone
    EndpointRolledBack { endpoint: String, step: String },

    SessionStarted { kind: String, migrated: usize },
    SessionStopped { kind: String },
    SessionCleared { kind: String },
}

impl Activity {
    /// Dotted key, e.g. `endpoint.migrated`.
    pub fn key(&self) -> &'static str {
        match self {
            Activity::AgentConnected { .. } => "agent.connected",
            Activity::EndpointProvisioned { .. } => "endpoint.provisioned",
            Activity::EndpointMigrated { .. } => "endpoint.migrated",
            Activity::EndpointRolledBack { .. } => "endpoint.rolled_back",
            Activity::SessionStarted { .. } => "session.started",
            Activity::SessionStopped { .. } => "session.stopped",
            Activity::SessionCleared { .. } => "session.cleared",
        }
    }

    /// Interface name for endpoint activity.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Activity::EndpointProvisioned { endpoint, .. }
            | Activity::EndpointMigrated { endpoint, .. }
            | Activity::EndpointRolledBack { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

/// One event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Id of the session that emitted it
    pub session: String,

    #[serde(flatten)]
    pub activity: Activity,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SessionEvent {
    pub fn key(&self) -> &'static str {
        self.activity.key()
    }
}

/// Broadcasts a session's events
#[derive(Clone)]
pub struct EventEmitter {
    session: Arc<str>,
    sender: Arc<broadcast::Sender<SessionEvent>>,
}

impl EventEmitter {
    pub fn new(session: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            session: Arc::from(session.into()),
            sender: Arc::new(sender),
        }
    }

    /// Emitter for `session` with the default capacity.
    pub fn for_session(session: impl Into<String>) -> Self {
        Self::new(session, 256)
    }

    /// Emit an event; dropped silently when nobody is subscribed
    pub fn emit(&self, activity: Activity) {
        let _ = self.sender.send(SessionEvent {
            session: self.session.to_string(),
            activity,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::for_session("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated(endpoint: &str) -> Activity {
        Activity::EndpointMigrated {
            endpoint: endpoint.to_string(),
            host: "h1".to_string(),
            address: Some("7.0.0.2/8".to_string()),
        }
    }

    #[tokio::test]
    async fn test_emit_and_receive_in_order() {
        let emitter = EventEmitter::new("s-1", 16);
        let mut rx = emitter.subscribe();

        emitter.emit(migrated("h1-eth0"));
        emitter.emit(migrated("h2-eth0"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.activity.endpoint(), Some("h1-eth0"));
        assert_eq!(second.activity.endpoint(), Some("h2-eth0"));
        assert_eq!(first.session, "s-1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        emitter.emit(Activity::SessionCleared {
            kind: "wifi".to_string(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let emitter = EventEmitter::for_session("s-2");
        let mut rx = emitter.subscribe();
        emitter.emit(Activity::AgentConnected {
            peer: "10.0.0.1:53724".to_string(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key(), "agent.connected");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent_connected");
        assert_eq!(json["peer"], "10.0.0.1:53724");
        assert_eq!(json["session"], "s-2");

        let parsed: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.activity, event.activity);
    }

    #[test]
    fn test_endpoint_only_for_endpoint_activity() {
        let started = Activity::SessionStarted {
            kind: "lte".to_string(),
            migrated: 2,
        };
        assert_eq!(started.endpoint(), None);
        assert_eq!(started.key(), "session.started");
        let rolled = Activity::EndpointRolledBack {
            endpoint: "h1-eth0".to_string(),
            step: "link-up".to_string(),
        };
        assert_eq!(rolled.endpoint(), Some("h1-eth0"));
    }
}
