use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Zenoh session settings for the upstream telemetry bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// Zenoh mode: "client", "peer", or "router".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Endpoints to connect to, e.g. `tcp/gateway:7447`.
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on (peer/router mode).
    #[serde(default)]
    pub listen: Vec<String>,
}

fn default_mode() -> String {
    "peer".to_string()
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
        }
    }
}

impl ZenohConfig {
    /// Check the mode and that every endpoint is `<protocol>/<address>`.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.mode.as_str(), "client" | "peer" | "router") {
            return Err(Error::Config(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                self.mode
            )));
        }

        if self.mode == "client" && self.connect.is_empty() {
            return Err(Error::Config(
                "Zenoh client mode needs at least one connect endpoint".to_string(),
            ));
        }

        for endpoint in self.connect.iter().chain(&self.listen) {
            match endpoint.split_once('/') {
                Some((proto, addr)) if !proto.is_empty() && !addr.is_empty() => {}
                _ => {
                    return Err(Error::Config(format!(
                        "Invalid Zenoh endpoint '{}'. Expected '<protocol>/<address>'",
                        endpoint
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive: "info", "debug", "metricsmq_exporter=trace".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,

    /// Targets capped at `warn` unless `level` names them explicitly.
    #[serde(default = "default_quiet")]
    pub quiet: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_quiet() -> Vec<String> {
    vec!["zenoh".to_string(), "rumqttc".to_string()]
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            quiet: default_quiet(),
        }
    }
}

impl LoggingConfig {
    /// Full `EnvFilter` directive string.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        for target in &self.quiet {
            let named = self
                .level
                .split(',')
                .any(|d| d.split('=').next() == Some(target.as_str()));
            if !named {
                directives.push(format!("{}=warn", target));
            }
        }
        directives.join(",")
    }
}
