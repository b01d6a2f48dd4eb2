//! Configuration

pub mod hot_reload;
pub mod load;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use load::{AntiReplayConfig, ProxyConfig, ReplayBackend, Secret};

/// Log verbosity as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Verbose,
    #[default]
    Normal,
    Silent,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn to_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "info,mtrelay=debug",
            LogLevel::Normal => "info",
            LogLevel::Silent => "warn",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Normal => "normal",
            LogLevel::Silent => "silent",
        })
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            "normal" | "info" => Ok(LogLevel::Normal),
            "silent" | "warn" | "error" => Ok(LogLevel::Silent),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}
