use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;

use crate::circle::code::DEFAULT_CODE_ATTEMPTS;
use crate::circle::UpdateMode;

/// Knobs for the coordination logic itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircleSettings {
    pub update_mode: UpdateMode,
    /// Random invite-code candidates tried before falling back to a time suffix
    pub code_attempts: u32,
}

impl Default for CircleSettings {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::LastWriteWins,
            code_attempts: DEFAULT_CODE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub circles: CircleSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:khatm.db".to_string());

        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:3000".to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDR must be a valid socket address")?;

        let strict = lookup("KHATM_STRICT_ASSIGNMENTS")
            .map(|value| parse_flag(&value))
            .transpose()
            .context("KHATM_STRICT_ASSIGNMENTS must be true or false")?
            .unwrap_or(false);

        let code_attempts = match lookup("KHATM_CODE_ATTEMPTS") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .context("KHATM_CODE_ATTEMPTS must be a valid number")?,
            None => DEFAULT_CODE_ATTEMPTS,
        };
        if code_attempts == 0 {
            bail!("KHATM_CODE_ATTEMPTS must be at least 1");
        }

        Ok(Config {
            database_url,
            bind_addr,
            circles: CircleSettings {
                update_mode: if strict {
                    UpdateMode::CompareStatus
                } else {
                    UpdateMode::LastWriteWins
                },
                code_attempts,
            },
        })
    }
}

/// Accepts the usual spellings of a boolean switch
pub fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("not a boolean: {}", other),
    }
}
