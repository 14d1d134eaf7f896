use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_restart_grace_ms() -> u64 {
    3_000
}

/// Session configuration. Injected at session start so tests can shrink the
/// restart grace delay and point at their own ICE servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// How long a dropped connection gets to self-heal before the offerer
    /// initiates an ICE restart.
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            restart_grace_ms: default_restart_grace_ms(),
        }
    }
}

impl SessionConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}
