use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;

use warden_proto::commands::{
    CreateInstanceRequest, DeleteInstanceRequest, ServerTarget, CMD_INSTANCES_CREATE,
    CMD_INSTANCES_DELETE, CMD_INSTANCES_LIST, CMD_LIST, CMD_START, CMD_STATUS, CMD_STOP,
};
use warden_proto::Message;

use crate::catalogue::Catalogue;
use crate::supervisor::Supervisor;

/// Dispatches one request message to the supervisor or the catalogue and
/// produces the response. Errors are embedded in the response envelope;
/// nothing here tears the link down.
pub struct Handler {
    agent_id: String,
    catalogue: Arc<Catalogue>,
    supervisor: Arc<Supervisor>,
    /// Fired after a successful instance create/delete so the control
    /// loop re-registers with the updated instance list.
    list_changed: mpsc::UnboundedSender<()>,
}

fn decode_payload<T: DeserializeOwned>(msg: &Message) -> Result<T, serde_json::Error> {
    let value = msg.payload.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value)
}

impl Handler {
    pub fn new(
        agent_id: String,
        catalogue: Arc<Catalogue>,
        supervisor: Arc<Supervisor>,
        list_changed: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            agent_id,
            catalogue,
            supervisor,
            list_changed,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Instance names advertised in register messages. The protocol field
    /// is still called `servers`; values are instance names.
    pub async fn served_instances(&self) -> Vec<String> {
        self.catalogue.instance_names().await
    }

    pub async fn handle(&self, msg: &Message) -> Message {
        match msg.request_type.as_str() {
            CMD_LIST => {
                let mut states = Vec::new();
                for name in self.catalogue.instance_names().await {
                    states.push(self.supervisor.status(&name).await);
                }
                self.respond(&msg.id, &states)
            }

            CMD_STATUS => {
                let target: ServerTarget = match decode_payload(msg) {
                    Ok(v) => v,
                    Err(err) => return self.bad_payload(&msg.id, err),
                };
                let state = self.supervisor.status(&target.server).await;
                self.respond(&msg.id, &state)
            }

            CMD_START => {
                let target: ServerTarget = match decode_payload(msg) {
                    Ok(v) => v,
                    Err(err) => return self.bad_payload(&msg.id, err),
                };

                let (spec, log_path) = match self.catalogue.resolve(&target.server).await {
                    Ok(v) => v,
                    Err(err) => {
                        return Message::error_response(&self.agent_id, &msg.id, err.to_string())
                    }
                };

                match self.supervisor.start(spec, &log_path).await {
                    Ok(state) => self.respond(&msg.id, &state),
                    Err(err) => {
                        let state = self.supervisor.status(&target.server).await;
                        self.respond(&msg.id, &state).with_error(err.to_string())
                    }
                }
            }

            CMD_STOP => {
                let target: ServerTarget = match decode_payload(msg) {
                    Ok(v) => v,
                    Err(err) => return self.bad_payload(&msg.id, err),
                };
                match self.supervisor.stop(&target.server).await {
                    Ok(state) => self.respond(&msg.id, &state),
                    Err(err) => {
                        // Callers still get the current state next to the error.
                        let state = self.supervisor.status(&target.server).await;
                        self.respond(&msg.id, &state).with_error(err.to_string())
                    }
                }
            }

            CMD_INSTANCES_LIST => {
                let summaries = self.catalogue.summaries().await;
                self.respond(&msg.id, &json!({ "instances": summaries }))
            }

            CMD_INSTANCES_CREATE => {
                let req: CreateInstanceRequest = match decode_payload(msg) {
                    Ok(v) => v,
                    Err(err) => return self.bad_payload(&msg.id, err),
                };
                match self
                    .catalogue
                    .create(&req.name, &req.template, req.enabled, req.params)
                    .await
                {
                    Ok(()) => {
                        let _ = self.list_changed.send(());
                        self.respond(&msg.id, &json!({ "ok": true, "name": req.name }))
                    }
                    Err(err) => Message::error_response(&self.agent_id, &msg.id, err.to_string()),
                }
            }

            CMD_INSTANCES_DELETE => {
                let req: DeleteInstanceRequest = match decode_payload(msg) {
                    Ok(v) => v,
                    Err(err) => return self.bad_payload(&msg.id, err),
                };
                match self
                    .catalogue
                    .delete(&req.name, req.force, req.delete_data)
                    .await
                {
                    Ok(()) => {
                        let _ = self.list_changed.send(());
                        self.respond(&msg.id, &json!({ "ok": true, "name": req.name }))
                    }
                    Err(err) => Message::error_response(&self.agent_id, &msg.id, err.to_string()),
                }
            }

            unknown => Message::error_response(
                &self.agent_id,
                &msg.id,
                format!("unknown command type: {unknown}"),
            ),
        }
    }

    fn respond<T: serde::Serialize>(&self, id: &str, payload: &T) -> Message {
        Message::response(&self.agent_id, id, payload).unwrap_or_else(|err| {
            Message::error_response(&self.agent_id, id, format!("encode response: {err}"))
        })
    }

    fn bad_payload(&self, id: &str, err: serde_json::Error) -> Message {
        Message::error_response(&self.agent_id, id, format!("bad payload: {err}"))
    }
}
