use serde::{Deserialize, Serialize};

/// Session and organization a run is attributed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeys {
    pub session_id: String,
    pub org: String,
}

impl SessionKeys {
    pub fn new(session_id: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            org: org.into(),
        }
    }
}

/// Supplies session keys when a run request does not carry its own.
pub trait SessionDefaults: Send + Sync {
    fn session_keys(&self) -> SessionKeys;
}

/// Reads `RUNSTREAM_SESSION_ID` and `RUNSTREAM_ORG`.
///
/// A missing session id is replaced by a random one chosen once per instance,
/// so every run of one controller shares it. A missing org falls back to
/// `demo`.
#[derive(Clone, Debug)]
pub struct EnvSessionDefaults {
    fallback_session_id: String,
}

impl EnvSessionDefaults {
    pub const DEFAULT_ORG: &'static str = "demo";

    pub fn new() -> Self {
        Self {
            fallback_session_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for EnvSessionDefaults {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDefaults for EnvSessionDefaults {
    fn session_keys(&self) -> SessionKeys {
        let session_id = non_blank_env("RUNSTREAM_SESSION_ID")
            .unwrap_or_else(|| self.fallback_session_id.clone());
        let org = non_blank_env("RUNSTREAM_ORG").unwrap_or_else(|| Self::DEFAULT_ORG.to_string());
        SessionKeys { session_id, org }
    }
}

/// Always returns the same keys.
#[derive(Clone, Debug)]
pub struct StaticSessionDefaults(pub SessionKeys);

impl StaticSessionDefaults {
    pub fn new(session_id: impl Into<String>, org: impl Into<String>) -> Self {
        Self(SessionKeys::new(session_id, org))
    }
}

impl SessionDefaults for StaticSessionDefaults {
    fn session_keys(&self) -> SessionKeys {
        self.0.clone()
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
