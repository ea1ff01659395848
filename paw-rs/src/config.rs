//! Runtime configuration.
//!
//! [`EngineConfig`] is what the library needs.  [`Config`] adds what the
//! `paw` binary needs on top and is assembled from defaults, then the
//! environment, then command-line flags:
//!
//! | Variable               | Effect                                    |
//! |------------------------|-------------------------------------------|
//! | `PAW_LOG`              | `tracing` filter directives               |
//! | `PAW_TOKEN_TIMEOUT_MS` | token deadline in ms, `0` disables it     |
//! | `PAW_LIB`              | library directory                         |

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// How long a token may stay unresumed before it is swept.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(300);

/// Filter used when neither `PAW_LOG` nor `--debug` is given.
pub const DEFAULT_LOG_FILTER: &str = "warn";

pub const ENV_LOG: &str = "PAW_LOG";
pub const ENV_TOKEN_TIMEOUT: &str = "PAW_TOKEN_TIMEOUT_MS";
pub const ENV_LIB: &str = "PAW_LIB";

// ── EngineConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline for tokens requested without an explicit one.  `None`
    /// disables expiry.
    pub token_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_timeout: Some(DEFAULT_TOKEN_TIMEOUT),
        }
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

/// Which init script the binary runs before anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InitScript {
    /// Look in the usual places (default).
    #[default]
    Search,
    /// `-n`: run none.
    Skip,
    /// `-f <file>`.
    Explicit(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub engine: EngineConfig,
    /// `tracing` filter directives; `None` means the default.
    pub log_filter: Option<String>,
    pub lib_dir: Option<PathBuf>,
    pub init: InitScript,
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(filter) = lookup(ENV_LOG).filter(|f| !f.trim().is_empty()) {
            config.log_filter = Some(filter);
        }
        if let Some(raw) = lookup(ENV_TOKEN_TIMEOUT) {
            config.engine.token_timeout = parse_timeout_ms(ENV_TOKEN_TIMEOUT, &raw)?;
        }
        if let Some(dir) = lookup(ENV_LIB).filter(|d| !d.is_empty()) {
            config.lib_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    /// Filter directives to install, honouring `--debug`.
    pub fn effective_log_filter(&self, debug: bool) -> String {
        match (&self.log_filter, debug) {
            (Some(f), _) => f.clone(),
            (None, true) => "debug".to_owned(),
            (None, false) => DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

/// Milliseconds to a deadline; `0` means no deadline.
pub fn parse_timeout_ms(var: &'static str, raw: &str) -> Result<Option<Duration>, ConfigError> {
    let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidTimeout {
        var,
        value: raw.to_owned(),
    })?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c.engine.token_timeout, Some(DEFAULT_TOKEN_TIMEOUT));
        assert_eq!(c.effective_log_filter(false), "warn");
        assert_eq!(c.effective_log_filter(true), "debug");
        assert_eq!(c.init, InitScript::Search);
    }

    #[test]
    fn environment_overrides() {
        let c = Config::from_lookup(lookup(&[
            ("PAW_LOG", "paw=trace"),
            ("PAW_TOKEN_TIMEOUT_MS", "250"),
            ("PAW_LIB", "/opt/paw"),
        ]))
        .unwrap();
        assert_eq!(c.engine.token_timeout, Some(Duration::from_millis(250)));
        assert_eq!(c.effective_log_filter(true), "paw=trace");
        assert_eq!(c.lib_dir, Some(PathBuf::from("/opt/paw")));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let c = Config::from_lookup(lookup(&[("PAW_TOKEN_TIMEOUT_MS", "0")])).unwrap();
        assert_eq!(c.engine.token_timeout, None);
    }

    #[test]
    fn bad_timeout_rejected() {
        let err = Config::from_lookup(lookup(&[("PAW_TOKEN_TIMEOUT_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidTimeout {
                var: "PAW_TOKEN_TIMEOUT_MS",
                value: "soon".into()
            }
        );
    }
}
