use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};

use warden_proto::{FramedLink, Kind, Message};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub servers: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One live agent link plus the table of requests awaiting its responses.
pub struct AgentConnection {
    info: Mutex<AgentInfo>,
    link: Arc<FramedLink>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

/// Removes a pending entry when the waiter goes away, whatever the path:
/// delivery (no-op by then), error, timeout, or a cancelled HTTP request
/// dropping the future mid-wait.
struct PendingGuard<'a> {
    conn: &'a AgentConnection,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.pending.lock().remove(self.id);
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not connected: {0}")]
    NotConnected(String),
    #[error("timeout waiting for agent response")]
    Timeout,
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("send request to agent: {0}")]
    Transport(#[from] warden_proto::LinkError),
    #[error("encode request payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Server-side map of connected agents. The map lock is never held across
/// link I/O; each connection's pending table has its own short-lived lock.
#[derive(Clone, Default)]
pub struct Registry {
    agents: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        agents.values().map(|conn| conn.info.lock().clone()).collect()
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        let conn = self.get(agent_id).await?;
        let info = conn.info.lock().clone();
        Some(info)
    }

    /// Register (or replace) an agent entry. On reconnect the new link
    /// wins; the previous connection's receive loop discovers its own
    /// close and removes itself.
    pub async fn register_agent(&self, agent_id: &str, servers: Vec<String>, link: Arc<FramedLink>) {
        let now = Utc::now();
        let conn = Arc::new(AgentConnection {
            info: Mutex::new(AgentInfo {
                agent_id: agent_id.to_string(),
                servers,
                connected_at: now,
                last_seen: now,
            }),
            link,
            pending: Mutex::new(HashMap::new()),
        });
        self.agents.write().await.insert(agent_id.to_string(), conn);
    }

    pub async fn update_agent_servers(&self, agent_id: &str, servers: Vec<String>) {
        if let Some(conn) = self.get(agent_id).await {
            let mut info = conn.info.lock();
            info.servers = servers;
            info.last_seen = Utc::now();
        }
    }

    pub async fn remove_agent(&self, agent_id: &str) {
        let removed = self.agents.write().await.remove(agent_id);
        if let Some(conn) = removed {
            // Unblock waiters; their requests will never be answered.
            conn.pending.lock().clear();
        }
    }

    pub async fn touch(&self, agent_id: &str) {
        if let Some(conn) = self.get(agent_id).await {
            conn.info.lock().last_seen = Utc::now();
        }
    }

    async fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Relay one request to an agent and wait for the correlated response.
    /// The pending entry is gone by the time this returns (or is dropped)
    /// on every path.
    pub async fn send_command<P: Serialize>(
        &self,
        agent_id: &str,
        request_type: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<Message, RegistryError> {
        let conn = self
            .get(agent_id)
            .await
            .ok_or_else(|| RegistryError::NotConnected(agent_id.to_string()))?;

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let request = Message::request(agent_id, &request_id, request_type, payload)?;

        let (tx, rx) = oneshot::channel();
        conn.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            conn: &conn,
            id: &request_id,
        };

        conn.link.send(&request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(RegistryError::ConnectionClosed),
            Err(_) => Err(RegistryError::Timeout),
        }
    }

    /// Route a message from an agent's receive loop. Responses go to their
    /// pending sink; late or duplicate responses are discarded.
    pub async fn handle_incoming(&self, msg: &Message) {
        self.touch(&msg.agent_id).await;

        if msg.kind != Kind::Response {
            return;
        }
        let Some(conn) = self.get(&msg.agent_id).await else {
            return;
        };

        let sender = conn.pending.lock().remove(&msg.id);
        if let Some(sender) = sender {
            let _ = sender.send(msg.clone());
        }
    }
}
