use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message kinds carried on the agent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Register,
    Request,
    Response,
    Heartbeat,
    /// Anything the peer sent that we do not recognise. Rejected by
    /// `validate`, never constructed locally.
    #[serde(other)]
    Unknown,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Register => "register",
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Heartbeat => "heartbeat",
            Kind::Unknown => "unknown",
        }
    }
}

/// One frame on the wire. Correlation is by `id`; `payload` stays opaque
/// at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{kind} missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("unknown kind")]
    UnknownKind,
}

impl Message {
    pub fn register<P: Serialize>(agent_id: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: Kind::Register,
            id: String::new(),
            agent_id: agent_id.to_string(),
            request_type: String::new(),
            payload: Some(serde_json::to_value(payload)?),
            error: String::new(),
            ts: Some(Utc::now()),
        })
    }

    pub fn request<P: Serialize>(
        agent_id: &str,
        id: &str,
        request_type: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: Kind::Request,
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            request_type: request_type.to_string(),
            payload: Some(serde_json::to_value(payload)?),
            error: String::new(),
            ts: Some(Utc::now()),
        })
    }

    pub fn response<P: Serialize>(
        agent_id: &str,
        id: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: Kind::Response,
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            request_type: String::new(),
            payload: Some(serde_json::to_value(payload)?),
            error: String::new(),
            ts: Some(Utc::now()),
        })
    }

    pub fn error_response(agent_id: &str, id: &str, error: impl Into<String>) -> Self {
        Self {
            kind: Kind::Response,
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            request_type: String::new(),
            payload: None,
            error: error.into(),
            ts: Some(Utc::now()),
        }
    }

    pub fn heartbeat(agent_id: &str) -> Self {
        Self {
            kind: Kind::Heartbeat,
            id: String::new(),
            agent_id: agent_id.to_string(),
            request_type: String::new(),
            payload: None,
            error: String::new(),
            ts: Some(Utc::now()),
        }
    }

    /// Attach an error string to a response that also carries a payload.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// Field presence rules per kind. Violations are reported to the peer,
    /// they never tear the link down.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let missing = |field| ProtocolError::MissingField {
            kind: self.kind.as_str(),
            field,
        };
        match self.kind {
            Kind::Register => {
                if self.agent_id.is_empty() {
                    return Err(missing("agent_id"));
                }
            }
            Kind::Request => {
                if self.id.is_empty() {
                    return Err(missing("id"));
                }
                if self.agent_id.is_empty() {
                    return Err(missing("agent_id"));
                }
                if self.request_type.is_empty() {
                    return Err(missing("type"));
                }
            }
            Kind::Response => {
                if self.id.is_empty() {
                    return Err(missing("id"));
                }
                if self.agent_id.is_empty() {
                    return Err(missing("agent_id"));
                }
            }
            Kind::Heartbeat => {
                if self.agent_id.is_empty() {
                    return Err(missing("agent_id"));
                }
            }
            Kind::Unknown => return Err(ProtocolError::UnknownKind),
        }
        Ok(())
    }
}
