use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Listen address, e.g. "127.0.0.1:3000".
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Token granting `User` authorization.
    pub user_token: String,

    /// Token granting `Admin` authorization (required for the ops topic).
    pub admin_token: String,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Interval between heartbeat envelopes, in seconds. Zero disables
    /// heartbeats, and with them the idle check.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Connections with no inbound traffic for this long are closed.
    /// Zero disables the idle check.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between `ops_event` publications. Zero disables the ticker.
    #[serde(default = "default_ops_tick_secs")]
    pub ops_tick_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_queue_capacity() -> usize {
    128
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_ops_tick_secs() -> u64 {
    15
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables (with prefix EVENTLINE)
            .add_source(Environment::with_prefix("EVENTLINE").separator("_"))
            .build()?;

        s.try_deserialize()
    }
}
