use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// Request types (`Message.type`).
pub const CMD_START: &str = "start";
pub const CMD_STOP: &str = "stop";
pub const CMD_STATUS: &str = "status";
pub const CMD_LIST: &str = "list";

pub const CMD_INSTANCES_LIST: &str = "instances.list";
pub const CMD_INSTANCES_CREATE: &str = "instances.create";
pub const CMD_INSTANCES_DELETE: &str = "instances.delete";

/// Register payload: the instance names an agent currently serves.
/// The field is called `servers` on the wire; values are instance names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Target of a start/stop/status request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,
    pub template: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInstanceRequest {
    pub name: String,
    /// Stop the instance first if it is running.
    #[serde(default)]
    pub force: bool,
    /// Also remove the instance directory.
    #[serde(default)]
    pub delete_data: bool,
}
