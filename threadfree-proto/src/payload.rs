//! Hub resource paths and JSON bodies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity the hub accepts together with the factory security key
pub const BOOTSTRAP_IDENTITY: &str = "Client_identity";

pub const PROVISION_PATH: &str = "15011/9063";
pub const DEVICE_PATH: &str = "15001";

pub const KEY_APPLICATION_NAME: &str = "9090";
pub const KEY_APPLICATION_SECRET: &str = "9091";

pub fn light_path(lamp_id: &str) -> String {
    format!("{DEVICE_PATH}/{lamp_id}")
}

/// Body of the key-minting POST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    #[serde(rename = "9090")]
    pub application_name: String,
}

impl ProvisioningRequest {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProvisioningReplyError {
    #[error("response is not a json object: {0}")]
    NotAnObject(String),
    #[error("expected response with key 9091")]
    MissingSecret { keys: Vec<String> },
    #[error("key 9091 is not a string")]
    SecretNotText { keys: Vec<String> },
    #[error("key 9091 is empty")]
    EmptySecret { keys: Vec<String> },
}

impl ProvisioningReplyError {
    /// Keys that were present in the reply
    pub fn keys(&self) -> &[String] {
        match self {
            ProvisioningReplyError::NotAnObject(_) => &[],
            ProvisioningReplyError::MissingSecret { keys }
            | ProvisioningReplyError::SecretNotText { keys }
            | ProvisioningReplyError::EmptySecret { keys } => keys,
        }
    }
}

/// Reply to the key-minting POST. Only the secret is kept.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisioningResponse {
    pub secret: String,
}

impl std::fmt::Debug for ProvisioningResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningResponse")
            .field("secret", &"***")
            .finish()
    }
}

impl ProvisioningResponse {
    pub fn from_json(payload: &[u8]) -> Result<Self, ProvisioningReplyError> {
        let mut body: Map<String, Value> = serde_json::from_slice(payload)
            .map_err(|e| ProvisioningReplyError::NotAnObject(e.to_string()))?;
        let keys: Vec<String> = body.keys().cloned().collect();
        match body.remove(KEY_APPLICATION_SECRET) {
            Some(Value::String(secret)) if secret.is_empty() => {
                Err(ProvisioningReplyError::EmptySecret { keys })
            }
            Some(Value::String(secret)) => Ok(Self { secret }),
            Some(_) => Err(ProvisioningReplyError::SecretNotText { keys }),
            None => Err(ProvisioningReplyError::MissingSecret { keys }),
        }
    }
}

/// Body of a light update PUT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightControl {
    #[serde(rename = "3311")]
    pub lights: Vec<LightState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightState {
    #[serde(rename = "5850")]
    pub on: u8,
    #[serde(rename = "5851")]
    pub dimmer: u8,
    #[serde(rename = "5709")]
    pub color_x: u16,
    #[serde(rename = "5710")]
    pub color_y: u16,
}

impl LightControl {
    pub fn single(state: LightState) -> Self {
        Self {
            lights: vec![state],
        }
    }
}
