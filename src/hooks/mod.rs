//! Trigger sources
//!
//! Webhook listeners and polling timers turn external events into
//! `request_sync` calls on branch units:
//!
//! - `github`: push webhook, `{"ref": "refs/heads/<b>", "head_commit": {"id": <sha>}}`
//! - `stash`: post-receive webhook, `{"refChanges": [{"refId": ..., "toHash": ...}]}`
//! - `polling`: fixed interval timer, no hint
//!
//! Several webhooks may share a port as long as their paths differ.

mod polling;
mod webhook;

pub use polling::start_polling;
pub use webhook::{parse_payload, WebhookRegistry, WebhookRoute};

use crate::config::HookConfig;
use std::time::Duration;
use thiserror::Error;

/// Shortest accepted polling period
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hook registration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HookError {
    #[error("Invalid hook type {0}")]
    InvalidType(String),

    #[error("Invalid webhook port {0}")]
    InvalidPort(String),

    #[error("No config url provided")]
    MissingUrl,

    #[error("Webhook url must be a plain path starting with '/': {0}")]
    InvalidUrl(String),

    #[error("Invalid polling interval {0}")]
    InvalidInterval(String),

    #[error("A webhook is already listening on {port}, {path}")]
    Conflict { port: u16, path: String },

    #[error("Failed to listen on port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

/// Webhook payload dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookProvider {
    Github,
    Stash,
}

impl WebhookProvider {
    pub fn name(self) -> &'static str {
        match self {
            WebhookProvider::Github => "github",
            WebhookProvider::Stash => "stash",
        }
    }
}

impl std::fmt::Display for WebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A checked hook registration
#[derive(Debug, Clone, PartialEq)]
pub enum HookSpec {
    Webhook {
        provider: WebhookProvider,
        port: u16,
        path: String,
    },
    Polling {
        interval: Duration,
        immediate: bool,
    },
}

impl HookSpec {
    /// Check a raw hook registration
    pub fn parse(config: &HookConfig) -> Result<Self, HookError> {
        let provider = match config.hook_type.as_str() {
            "github" => WebhookProvider::Github,
            "stash" => WebhookProvider::Stash,
            "polling" => return Self::parse_polling(config),
            other => return Err(HookError::InvalidType(other.to_string())),
        };

        let port = match config.port {
            Some(port) if port > 0 => port,
            Some(port) => return Err(HookError::InvalidPort(port.to_string())),
            None => return Err(HookError::InvalidPort("undefined".to_string())),
        };

        let path = match config.url.as_deref() {
            None | Some("") => return Err(HookError::MissingUrl),
            Some(path) if !path.starts_with('/') || path.contains(['{', '}']) => {
                return Err(HookError::InvalidUrl(path.to_string()))
            }
            Some(path) => path.to_string(),
        };

        Ok(HookSpec::Webhook {
            provider,
            port,
            path,
        })
    }

    fn parse_polling(config: &HookConfig) -> Result<Self, HookError> {
        let minutes = match config.interval {
            Some(minutes) if minutes.is_finite() && minutes > 0.0 => minutes,
            Some(minutes) => return Err(HookError::InvalidInterval(minutes.to_string())),
            None => return Err(HookError::InvalidInterval("undefined".to_string())),
        };

        let interval = Duration::try_from_secs_f64(minutes * 60.0)
            .ok()
            .filter(|interval| *interval >= MIN_POLL_INTERVAL)
            .ok_or_else(|| HookError::InvalidInterval(minutes.to_string()))?;

        Ok(HookSpec::Polling {
            interval,
            immediate: config.immediate_polling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webhooks() {
        assert_eq!(
            HookSpec::parse(&HookConfig::github(5050, "/gitpoke")).unwrap(),
            HookSpec::Webhook {
                provider: WebhookProvider::Github,
                port: 5050,
                path: "/gitpoke".into(),
            }
        );

        let stash = HookSpec::parse(&HookConfig::stash(5252, "/stashpoke")).unwrap();
        assert!(matches!(
            stash,
            HookSpec::Webhook {
                provider: WebhookProvider::Stash,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_polling() {
        let mut hook = HookConfig::polling(0.5);
        hook.immediate_polling = true;
        assert_eq!(
            HookSpec::parse(&hook).unwrap(),
            HookSpec::Polling {
                interval: Duration::from_secs(30),
                immediate: true,
            }
        );

        // A hundredth of a minute is still a usable period
        match HookSpec::parse(&HookConfig::polling(0.01)).unwrap() {
            HookSpec::Polling { interval, .. } => {
                assert!(interval > Duration::from_millis(599));
                assert!(interval < Duration::from_millis(601));
            }
            other => panic!("unexpected hook {:?}", other),
        }

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e300, 1e-12] {
            assert_eq!(
                HookSpec::parse(&HookConfig::polling(bad)),
                Err(HookError::InvalidInterval(bad.to_string()))
            );
        }
        let missing = HookConfig {
            hook_type: "polling".into(),
            ..Default::default()
        };
        assert_eq!(
            HookSpec::parse(&missing).unwrap_err().to_string(),
            "Invalid polling interval undefined"
        );
    }

    #[test]
    fn test_parse_errors() {
        let unknown = HookConfig {
            hook_type: "unknown".into(),
            ..Default::default()
        };
        assert_eq!(
            HookSpec::parse(&unknown).unwrap_err().to_string(),
            "Invalid hook type unknown"
        );

        let no_url = HookConfig {
            url: None,
            ..HookConfig::github(5050, "")
        };
        assert_eq!(HookSpec::parse(&no_url).unwrap_err(), HookError::MissingUrl);

        let relative = HookConfig::github(5050, "gitpoke");
        assert!(matches!(
            HookSpec::parse(&relative),
            Err(HookError::InvalidUrl(_))
        ));

        let zero_port = HookConfig::stash(0, "/poke");
        assert_eq!(
            HookSpec::parse(&zero_port).unwrap_err().to_string(),
            "Invalid webhook port 0"
        );
    }
}
