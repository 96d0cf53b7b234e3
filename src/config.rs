//! Configuration loading for the JIT token tool.
//!
//! Loads configuration from a TOML file and/or environment variables using
//! figment, with command-line flags applied on top by `main`. Priority,
//! lowest to highest:
//!
//! 1. Default values (from `#[serde(default)]` attributes)
//! 2. Stage profile (`--stage prod` bakes in the known App/installation ids)
//! 3. TOML config file (if provided)
//! 4. Environment variables (prefix: `FPGA_JIT_`, nested with `__`)
//! 5. Command-line flags
//!
//! # Environment Variable Naming
//!
//! - `FPGA_JIT_GITHUB__APP_ID` → `github.app_id`
//! - `FPGA_JIT_GITHUB__PRIVATE_KEY_PATH` → `github.private_key_path`
//! - `FPGA_JIT_HTTP__MAX_ATTEMPTS` → `http.max_attempts`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Deployment stage, selecting a baked-in GitHub App profile.
///
/// `carl` is the single-board development bench; `prod` is the fleet
/// attached to the chipsalliance organization. `staging` has no baked
/// profile and requires explicit App configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Carl,
    Staging,
    Prod,
}

/// Baked-in GitHub App identity for a stage.
pub struct StageProfile {
    pub app_id: u64,
    pub installation_id: u64,
    pub org: &'static str,
}

impl Stage {
    /// Known App/installation ids per stage. `None` means the stage has no
    /// baked profile and the operator must configure the App explicitly.
    pub fn profile(self) -> Option<StageProfile> {
        match self {
            Stage::Carl => Some(StageProfile {
                app_id: 1160975,
                installation_id: 61798278,
                org: "clundin25-testorg",
            }),
            Stage::Staging => None,
            Stage::Prod => Some(StageProfile {
                app_id: 379559,
                installation_id: 40993215,
                org: "chipsalliance",
            }),
        }
    }
}

/// GitHub runner registration scope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerScope {
    /// Organization-level runner
    Organization { name: String },

    /// Repository-level runner
    Repository { owner: String, repo: String },
}

impl RunnerScope {
    /// The account (org or repo owner) that the App installation must cover.
    pub fn account(&self) -> &str {
        match self {
            RunnerScope::Organization { name } => name,
            RunnerScope::Repository { owner, .. } => owner,
        }
    }

    /// API path for generating a JIT runner configuration.
    pub fn jit_config_path(&self) -> String {
        match self {
            RunnerScope::Organization { name } => {
                format!("/orgs/{}/actions/runners/generate-jitconfig", name)
            }
            RunnerScope::Repository { owner, repo } => {
                format!("/repos/{}/{}/actions/runners/generate-jitconfig", owner, repo)
            }
        }
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerScope::Organization { name } => write!(f, "org {}", name),
            RunnerScope::Repository { owner, repo } => write!(f, "repo {}/{}", owner, repo),
        }
    }
}

/// GitHub App authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// GitHub App ID (the JWT issuer)
    #[serde(default)]
    pub app_id: u64,

    /// Path to the GitHub App private key PEM file
    #[serde(default)]
    pub private_key_path: PathBuf,

    /// Installation ID. Auto-discovered from the App's installations when
    /// not set.
    #[serde(default)]
    pub installation_id: Option<u64>,

    /// GitHub API base URL (override for testing against a stub server)
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            private_key_path: PathBuf::new(),
            installation_id: None,
            api_url: default_api_url(),
        }
    }
}

/// HTTP timeout and retry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds. A request exceeding this is treated
    /// as a transport failure.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum attempts per network stage (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds (doubles per attempt)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Main configuration for the JIT token tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// GitHub App configuration
    #[serde(default)]
    pub github: GitHubConfig,

    /// Runner scope (org or repo). Usually derived from the stage profile
    /// or the `--org`/`--repo` flags.
    #[serde(default)]
    pub scope: Option<RunnerScope>,

    /// Runner group the JIT runner joins (the fleet uses a single group)
    #[serde(default = "default_runner_group_id")]
    pub runner_group_id: u64,

    /// HTTP timeout and retry settings
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_runner_group_id() -> u64 {
    1
}

impl Config {
    /// Load configuration from an optional TOML file plus environment
    /// variables. The file may be absent; env vars always apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("FPGA_JIT_").split("__"));

        let config: Config = figment
            .extract()
            .context("Failed to load config from file and environment")?;

        Ok(config)
    }

    /// Fill in unset fields from a stage's baked profile.
    pub fn apply_stage(&mut self, stage: Stage) {
        let Some(profile) = stage.profile() else {
            return;
        };
        if self.github.app_id == 0 {
            self.github.app_id = profile.app_id;
        }
        if self.github.installation_id.is_none() {
            self.github.installation_id = Some(profile.installation_id);
        }
        if self.scope.is_none() {
            self.scope = Some(RunnerScope::Organization {
                name: profile.org.to_string(),
            });
        }
    }

    /// Check that everything the pipeline needs is present.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        use crate::error::Error;

        if self.github.app_id == 0 {
            return Err(Error::config(
                "GitHub App id is not set (use --app-id, --stage, or the config file)",
            ));
        }
        if self.github.private_key_path.as_os_str().is_empty() {
            return Err(Error::config(
                "GitHub App private key path is not set (use --key-path)",
            ));
        }
        if self.scope.is_none() {
            return Err(Error::config(
                "runner scope is not set (use --org, --repo, or --stage)",
            ));
        }
        if self.http.max_attempts == 0 {
            return Err(Error::config("http.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Toml as TomlProvider;

    /// Helper to parse TOML config strings in tests
    fn parse_config(toml_str: &str) -> Config {
        Figment::new()
            .merge(TomlProvider::string(toml_str))
            .extract()
            .expect("config should parse")
    }

    #[test]
    fn test_defaults() {
        let config = parse_config("");
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.runner_group_id, 1);
        assert_eq!(config.http.max_attempts, 3);
        assert_eq!(config.http.request_timeout_secs, 30);
        assert!(config.scope.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            runner_group_id = 2

            [github]
            app_id = 379559
            private_key_path = "/etc/fpga-jit/app.pem"
            installation_id = 40993215

            [scope]
            type = "organization"
            name = "chipsalliance"

            [http]
            max_attempts = 5
            base_delay_ms = 250
            "#,
        );
        assert_eq!(config.github.app_id, 379559);
        assert_eq!(config.github.installation_id, Some(40993215));
        assert_eq!(config.runner_group_id, 2);
        assert_eq!(config.http.max_attempts, 5);
        assert_eq!(config.http.base_delay_ms, 250);
        assert_eq!(
            config.scope,
            Some(RunnerScope::Organization {
                name: "chipsalliance".into()
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stage_profile_fills_unset_fields() {
        let mut config = parse_config("");
        config.apply_stage(Stage::Prod);
        assert_eq!(config.github.app_id, 379559);
        assert_eq!(config.github.installation_id, Some(40993215));
        assert_eq!(
            config.scope.as_ref().map(|s| s.account().to_string()),
            Some("chipsalliance".to_string())
        );

        // Explicit config wins over the profile
        let mut config = parse_config("[github]\napp_id = 42");
        config.apply_stage(Stage::Prod);
        assert_eq!(config.github.app_id, 42);
    }

    #[test]
    fn test_staging_has_no_profile() {
        let mut config = parse_config("");
        config.apply_stage(Stage::Staging);
        assert_eq!(config.github.app_id, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jit_config_paths() {
        let org = RunnerScope::Organization {
            name: "caliptra-sw".into(),
        };
        assert_eq!(
            org.jit_config_path(),
            "/orgs/caliptra-sw/actions/runners/generate-jitconfig"
        );

        let repo = RunnerScope::Repository {
            owner: "chipsalliance".into(),
            repo: "caliptra-sw".into(),
        };
        assert_eq!(
            repo.jit_config_path(),
            "/repos/chipsalliance/caliptra-sw/actions/runners/generate-jitconfig"
        );
        assert_eq!(repo.account(), "chipsalliance");
    }

    #[test]
    fn test_validate_rejects_missing_key_path() {
        let config = parse_config(
            r#"
            [github]
            app_id = 1

            [scope]
            type = "organization"
            name = "x"
            "#,
        );
        assert!(config.validate().is_err());
    }
}
