use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};

use warden_proto::commands::RegisterPayload;
use warden_proto::{FramedLink, Kind, Message};

use crate::registry::Registry;

/// Accepts agent connections and feeds their messages to the registry.
pub struct AgentListener {
    listener: TcpListener,
    registry: Registry,
}

fn decode_register(msg: &Message) -> Option<RegisterPayload> {
    let payload = msg.payload.clone()?;
    serde_json::from_value(payload).ok()
}

impl AgentListener {
    pub async fn bind(addr: &str, registry: Registry) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listen on {addr}"))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "agent listener started");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "accept error");
                    continue;
                }
            };
            let registry = self.registry.clone();
            tokio::spawn(handle_conn(registry, stream, peer));
        }
    }
}

async fn handle_conn(registry: Registry, stream: TcpStream, peer: SocketAddr) {
    let link = Arc::new(FramedLink::new(stream));

    // The first frame must be a valid register; anything else closes the
    // connection.
    let first = match link.recv().await {
        Ok(msg) => msg,
        Err(_) => return,
    };
    if first.kind != Kind::Register || first.validate().is_err() {
        tracing::warn!(%peer, "first message was not a valid register; closing");
        return;
    }
    let Some(payload) = decode_register(&first) else {
        tracing::warn!(%peer, "undecodable register payload; closing");
        return;
    };

    let agent_id = first.agent_id.clone();
    registry
        .register_agent(&agent_id, payload.servers.clone(), link.clone())
        .await;
    tracing::info!(agent_id = %agent_id, %peer, servers = ?payload.servers, "agent registered");

    loop {
        let msg = match link.recv().await {
            Ok(msg) => msg,
            Err(err) if err.is_parse() => {
                tracing::warn!(agent_id = %agent_id, error = %err, "dropping malformed frame");
                continue;
            }
            Err(_) => {
                tracing::info!(agent_id = %agent_id, "agent disconnected");
                registry.remove_agent(&agent_id).await;
                return;
            }
        };

        if let Err(err) = msg.validate() {
            tracing::warn!(agent_id = %agent_id, error = %err, "dropping invalid message");
            continue;
        }

        // Agents may re-register mid-connection to refresh their
        // advertised instance list.
        if msg.kind == Kind::Register {
            if let Some(update) = decode_register(&msg) {
                registry
                    .update_agent_servers(&msg.agent_id, update.servers.clone())
                    .await;
                tracing::info!(
                    agent_id = %msg.agent_id,
                    servers = ?update.servers,
                    "agent updated registration"
                );
            }
            continue;
        }

        registry.handle_incoming(&msg).await;
    }
}
