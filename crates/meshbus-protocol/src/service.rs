use serde::{Deserialize, Serialize};

use crate::constants::PROTOCOL_VERSION;

/// Identity of the process that sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetails {
    /// Logical service name, shared by all instances of a service.
    pub name: String,
    pub version: String,
    /// Unique per running instance.
    pub instance_id: String,
    pub pid: u32,
}

impl ServiceDetails {
    /// Describe this process under `name` with a freshly generated instance id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: PROTOCOL_VERSION.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
        }
    }

    /// Same as [`ServiceDetails::new`] but with a caller-chosen instance id.
    pub fn with_instance_id(name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::new(name)
        }
    }
}
