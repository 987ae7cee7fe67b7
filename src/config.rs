// Loaded configuration for the option handlers and the mudopts binary.

use std::{fs::read_to_string, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        mssp::MsspData,
        telopt::{default_usage, TelOptUsage, TerminalSide},
    },
};

/// How this end introduces itself in `Core.Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    pub gmcp: bool,
    pub mssp: bool,
    pub mccp2: bool,
    pub mccp3: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            gmcp: true,
            mssp: true,
            mccp2: true,
            mccp3: true,
        }
    }
}

impl OptionsConfig {
    pub fn enabled(&self, code: u8) -> bool {
        match code {
            tc::GMCP => self.gmcp,
            tc::MSSP => self.mssp,
            tc::MCCP2 => self.mccp2,
            tc::MCCP3 => self.mccp3,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub side: TerminalSide,
    pub client: ClientInfo,
    pub options: OptionsConfig,
    // uptime must be a quoted RFC 3339 string; bare TOML datetimes are rejected.
    pub mssp: MsspData,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            side: TerminalSide::Server,
            client: ClientInfo::default(),
            options: OptionsConfig::default(),
            mssp: MsspData::default(),
        }
    }
}

impl FromStr for Config {
    type Err = TelOptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl Config {
    // Reads a toml file and parses it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TelOptError> {
        let conf_txt = read_to_string(path)?;
        conf_txt.parse()
    }

    /// The usage for `code` on the configured side, or `None` if the option is
    /// disabled or unknown.
    pub fn usage(&self, code: u8) -> Option<TelOptUsage> {
        if !self.options.enabled(code) {
            return None;
        }
        default_usage(code, self.side)
    }
}
