//! Repository configuration
//!
//! One mirrored repository: where to clone it from, which branches to track,
//! how keys are laid out and which trigger sources drive it.

use serde::{Deserialize, Deserializer, Serialize};

/// Raw trigger source registration as written in the config file.
///
/// A bad hook is reported against its repository rather than failing the
/// whole file; [`crate::hooks::HookSpec::parse`] turns it into a validated hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    /// `github`, `stash` or `polling`
    #[serde(rename = "type")]
    pub hook_type: String,

    /// Listening port (webhooks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Request path (webhooks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Poll interval in minutes (polling); a number or a numeric string
    #[serde(
        default,
        deserialize_with = "deserialize_interval",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<f64>,

    /// Poll once right away instead of waiting one interval (polling)
    #[serde(default)]
    pub immediate_polling: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInterval {
    Number(f64),
    Text(String),
}

/// Intervals written as strings (`interval: '.01'`) are accepted; text that is
/// not a number becomes NaN and is rejected when the hook is validated, so a
/// bad interval fails only its repository.
fn deserialize_interval<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawInterval>::deserialize(deserializer)? {
        None => None,
        Some(RawInterval::Number(minutes)) => Some(minutes),
        Some(RawInterval::Text(text)) => Some(text.trim().parse().unwrap_or(f64::NAN)),
    })
}

impl HookConfig {
    /// A GitHub push webhook
    pub fn github(port: u16, url: impl Into<String>) -> Self {
        Self {
            hook_type: "github".to_string(),
            port: Some(port),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// A Stash / Bitbucket Server post-receive webhook
    pub fn stash(port: u16, url: impl Into<String>) -> Self {
        Self {
            hook_type: "stash".to_string(),
            port: Some(port),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// A polling timer firing every `minutes`
    pub fn polling(minutes: f64) -> Self {
        Self {
            hook_type: "polling".to_string(),
            interval: Some(minutes),
            ..Default::default()
        }
    }
}

/// A mirrored repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Repository name; first segment of every KV key
    pub name: String,

    /// Git remote URL
    pub url: String,

    /// Branches to mirror
    #[serde(default)]
    pub branches: Vec<String>,

    /// Insert the branch name after the repository name in data keys
    #[serde(default = "default_include_branch_name")]
    pub include_branch_name: bool,

    /// Git credential for HTTPS remotes, literal or `$ENV_VAR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Trigger sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookConfig>,
}

fn default_include_branch_name() -> bool {
    true
}

impl RepoConfig {
    /// Create a repository with no branches or hooks
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            branches: Vec::new(),
            include_branch_name: default_include_branch_name(),
            token: None,
            hooks: Vec::new(),
        }
    }

    /// Track a branch
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.push(branch.into());
        self
    }

    /// Add a trigger source
    pub fn with_hook(mut self, hook: HookConfig) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Set the key layout
    pub fn with_branch_name_in_keys(mut self, include: bool) -> Self {
        self.include_branch_name = include;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let repo = RepoConfig::new("cfg", "git@github.com:org/cfg.git")
            .with_branch("main")
            .with_branch("dev")
            .with_hook(HookConfig::github(5050, "/gitpoke"))
            .with_branch_name_in_keys(false);

        assert_eq!(repo.branches, vec!["main", "dev"]);
        assert_eq!(repo.hooks[0].port, Some(5050));
        assert!(!repo.include_branch_name);
    }

    #[test]
    fn test_unknown_hook_type_still_parses() {
        let repo: RepoConfig = serde_yaml::from_str(
            "name: r\nurl: /tmp/r\nbranches: [main]\nhooks:\n  - type: carrier-pigeon\n",
        )
        .unwrap();
        assert_eq!(repo.hooks[0].hook_type, "carrier-pigeon");
    }

    #[test]
    fn test_interval_as_number_or_string() {
        let repo: RepoConfig = serde_yaml::from_str(
            r#"
name: r
url: /tmp/r
branches: [main]
hooks:
  - type: polling
    interval: 2
  - type: polling
    interval: '.01'
  - type: polling
    interval: " 1.5 "
  - type: polling
    interval: soon
  - type: polling
"#,
        )
        .unwrap();

        let intervals: Vec<Option<f64>> = repo.hooks.iter().map(|h| h.interval).collect();
        assert_eq!(intervals[0], Some(2.0));
        assert_eq!(intervals[1], Some(0.01));
        assert_eq!(intervals[2], Some(1.5));
        assert!(intervals[3].unwrap().is_nan());
        assert_eq!(intervals[4], None);
    }
}
