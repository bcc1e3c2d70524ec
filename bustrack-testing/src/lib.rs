use bustrack_logic::{Coordinate, EntityKey, PermissionLevel, Role, SessionUpdate};
use interprocess::local_socket::{GenericNamespaced, Name, ToNsName};
use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use anyhow::{Context, anyhow, bail};
    pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
}

pub use prelude::*;

pub fn get_socket_name(base_name: String) -> Result<Name<'static>> {
    base_name
        .to_ns_name::<GenericNamespaced>()
        .context("Failed to parse socket name")
}

/// How the scripted permission prompt answers the next requests
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptAnswers {
    pub foreground: bool,
    pub background: bool,
}

impl PromptAnswers {
    pub fn answer(&self, level: PermissionLevel) -> bool {
        match level {
            PermissionLevel::Foreground => self.foreground,
            PermissionLevel::Background => self.background,
        }
    }
}

impl Default for PromptAnswers {
    fn default() -> Self {
        Self {
            foreground: true,
            background: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestingRequest {
    /// Store a driver credential
    Login(String),
    Logout,
    Mount(Role, EntityKey),
    Unmount,
    /// Change how future permission prompts are answered
    SetPermissions(PromptAnswers),
    /// Revoke a granted level without prompting, like the user did it in system settings
    Revoke(PermissionLevel),
    /// Feed a fix to every live sensor watch
    Sample(Coordinate),
    SensorError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestingResponse {
    Complete,
    Update(SessionUpdate),
    Error(String),
}

impl From<anyhow::Error> for TestingResponse {
    fn from(value: anyhow::Error) -> Self {
        TestingResponse::Error(format!("{value:#}"))
    }
}

impl From<SessionUpdate> for TestingResponse {
    fn from(val: SessionUpdate) -> Self {
        TestingResponse::Update(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_lines() {
        let req = TestingRequest::Mount(Role::Publisher, EntityKey::default());
        let encoded = serde_json::to_string(&req).unwrap();
        assert!(!encoded.contains('\n'));
        assert_eq!(encoded, r#"{"Mount":["Publisher","busLocation"]}"#);
    }

    #[test]
    fn test_error_response_keeps_context() {
        let err = anyhow!("Connection refused").context("Failed to reach database");
        let TestingResponse::Error(msg) = TestingResponse::from(err) else {
            panic!("Expected an error");
        };
        assert_eq!(msg, "Failed to reach database: Connection refused");
    }
}
