//! Runtime configuration
//!
//! Every section falls back to its defaults, so an empty TOML document is a
//! valid configuration:
//!
//! ```toml
//! [node]
//! response_timeout_ms = 5000
//! watchdog_ms = 15000
//!
//! [router]
//! max_queue_depth = 4096
//!
//! [master]
//! node_timeout_ms = 5000
//! probe_timeout_ms = 500
//!
//! [parser]
//! max_frame_len = 1000000
//! ```

use std::{fs, path::Path, time::Duration};

use idp_frame::{FrameParser, CRC_LEN, DEFAULT_MAX_FRAME_LEN, FRAME_OVERHEAD};
use serde::{Deserialize, Serialize};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdpConfig {
    pub node: NodeConfig,
    pub router: RouterConfig,
    pub master: MasterConfig,
    pub parser: ParserConfig,
}

impl IdpConfig {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        non_zero("node.response_timeout_ms", self.node.response_timeout_ms)?;
        non_zero("node.enumeration_timeout_ms", self.node.enumeration_timeout_ms)?;
        non_zero("node.recommend_interval_ms", self.node.recommend_interval_ms)?;
        if let Some(ms) = self.node.watchdog_ms {
            non_zero("node.watchdog_ms", ms)?;
        }
        if self.router.max_queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "router.max_queue_depth",
                reason: "must hold at least one packet".into(),
            });
        }
        non_zero("master.node_timeout_ms", self.master.node_timeout_ms)?;
        non_zero("master.probe_timeout_ms", self.master.probe_timeout_ms)?;
        non_zero("master.response_timeout_ms", self.master.response_timeout_ms)?;
        let min_frame = (FRAME_OVERHEAD + CRC_LEN) as u32;
        if self.parser.max_frame_len < min_frame {
            return Err(ConfigError::InvalidValue {
                field: "parser.max_frame_len",
                reason: format!("must be at least {min_frame}"),
            });
        }
        if self.parser.read_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "parser.read_buffer",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

fn non_zero(field: &'static str, ms: u64) -> ConfigResult<()> {
    if ms == 0 {
        Err(ConfigError::InvalidValue {
            field,
            reason: "timeouts must be non-zero".into(),
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long `send_request_async` waits for a reply
    pub response_timeout_ms: u64,
    /// Reset the node if the master has not pinged it for this long
    pub watchdog_ms: Option<u64>,
    /// How long `wait_until_enumerated` waits
    pub enumeration_timeout_ms: u64,
    /// How often an unenumerated node nudges the master
    pub recommend_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            watchdog_ms: None,
            enumeration_timeout_ms: 5000,
            recommend_interval_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }

    pub fn recommend_interval(&self) -> Duration {
        Duration::from_millis(self.recommend_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Packets the router's work queue may hold before it starts dropping
    pub max_queue_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Nodes not heard from within this long are evicted
    pub node_timeout_ms: u64,
    /// How long to wait for a downstream router to answer an adaptor probe
    pub probe_timeout_ms: u64,
    /// How long to wait for replies to discovery requests
    pub response_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 5000,
            probe_timeout_ms: 500,
            response_timeout_ms: 5000,
        }
    }
}

impl MasterConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Frames declaring more bytes than this are discarded
    pub max_frame_len: u32,
    /// Size of the read buffer used by stream adaptors
    pub read_buffer: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer: 4096,
        }
    }
}

impl ParserConfig {
    pub fn parser(&self) -> FrameParser {
        FrameParser::with_max_len(self.max_frame_len)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ConfigError, IdpConfig};

    #[test]
    fn empty_is_default() {
        let config = IdpConfig::from_toml_str("").unwrap();
        assert_eq!(config, IdpConfig::default());
        assert_eq!(config.node.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.master.probe_timeout(), Duration::from_millis(500));
        assert_eq!(config.parser.max_frame_len, 1_000_000);
    }

    #[test]
    fn partial_override() {
        let config = IdpConfig::from_toml_str(
            r#"
            [node]
            watchdog_ms = 15000

            [master]
            node_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.node.watchdog(), Some(Duration::from_secs(15)));
        assert_eq!(config.node.response_timeout_ms, 5000);
        assert_eq!(config.master.node_timeout(), Duration::from_millis(2500));
        assert_eq!(config.router.max_queue_depth, 4096);
    }

    #[test]
    fn rejects_bad_values() {
        let err = IdpConfig::from_toml_str("[master]\nprobe_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "master.probe_timeout_ms",
                ..
            }
        ));

        let err = IdpConfig::from_toml_str("[parser]\nmax_frame_len = 8\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = IdpConfig::from_toml_str("[node\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
