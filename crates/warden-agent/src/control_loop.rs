use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use warden_proto::commands::RegisterPayload;
use warden_proto::{FramedLink, Kind, LinkError, Message};

use crate::handler::Handler;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Dials the command server, registers, and serves requests until the
/// link fails, then reconnects forever with exponential backoff. The
/// agent never initiates requests; it is a pure reactive worker.
pub struct ControlLoop {
    agent_id: String,
    server_addr: String,
    handler: Arc<Handler>,
    /// Catalogue-changed notifications; each one triggers a fresh
    /// register frame with the updated instance list.
    list_changed: Arc<Mutex<mpsc::UnboundedReceiver<()>>>,
}

impl ControlLoop {
    pub fn new(
        agent_id: String,
        server_addr: String,
        handler: Arc<Handler>,
        list_changed: mpsc::UnboundedReceiver<()>,
    ) -> Self {
        Self {
            agent_id,
            server_addr,
            handler,
            list_changed: Arc::new(Mutex::new(list_changed)),
        }
    }

    pub async fn run(self) {
        let mut backoff = BACKOFF_START;
        loop {
            if let Err(err) = self.connect_and_serve(&mut backoff).await {
                tracing::warn!(error = %err, "connection ended");
            }
            tracing::info!(delay = ?backoff, "reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn connect_and_serve(&self, backoff: &mut Duration) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        let link = Arc::new(FramedLink::new(stream));

        let servers = self.handler.served_instances().await;
        link.send(&Message::register(
            &self.agent_id,
            &RegisterPayload {
                servers: servers.clone(),
            },
        )?)
        .await?;
        *backoff = BACKOFF_START;
        tracing::info!(server = %self.server_addr, ?servers, "registered with command server");

        // Heartbeats and re-registration share the link's writer lock with
        // the response sends below.
        let side = tokio::spawn(side_channel(
            link.clone(),
            self.agent_id.clone(),
            self.handler.clone(),
            self.list_changed.clone(),
        ));

        let result = self.serve(&link).await;
        side.abort();
        result
    }

    async fn serve(&self, link: &FramedLink) -> anyhow::Result<()> {
        loop {
            let msg = match link.recv().await {
                Ok(msg) => msg,
                // A bad frame does not close the stream; skip it.
                Err(err) if err.is_parse() => {
                    tracing::warn!(error = %err, "dropping malformed frame");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if let Err(err) = msg.validate() {
                tracing::warn!(error = %err, "dropping invalid message");
                continue;
            }
            if msg.kind != Kind::Request {
                continue;
            }
            if msg.agent_id != self.agent_id {
                tracing::warn!(
                    target_agent = %msg.agent_id,
                    "ignoring request for another agent"
                );
                continue;
            }

            let resp = self.handler.handle(&msg).await;
            link.send(&resp).await?;
        }
    }
}

async fn side_channel(
    link: Arc<FramedLink>,
    agent_id: String,
    handler: Arc<Handler>,
    list_changed: Arc<Mutex<mpsc::UnboundedReceiver<()>>>,
) {
    let mut rx = list_changed.lock().await;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick fires immediately; the register frame already went out.
    ticker.tick().await;

    loop {
        let sent: Result<(), LinkError> = tokio::select! {
            _ = ticker.tick() => link.send(&Message::heartbeat(&agent_id)).await,
            changed = rx.recv() => match changed {
                Some(()) => {
                    let servers = handler.served_instances().await;
                    match Message::register(&agent_id, &RegisterPayload { servers }) {
                        Ok(msg) => link.send(&msg).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "encode register");
                            continue;
                        }
                    }
                }
                None => return,
            },
        };

        if sent.is_err() {
            // The main receive loop will observe the same failure and
            // tear the iteration down.
            return;
        }
    }
}
