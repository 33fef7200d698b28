//! Bridge configuration loading and validation.
//!
//! Two sources, checked in order:
//! 1. A YAML file named by `MCP_BRIDGE_CONFIG`, with `${VAR}` and
//!    `${VAR:-default}` interpolation.
//! 2. The process environment, which describes the GitHub MCP server running
//!    under Docker (`GITHUB_PERSONAL_ACCESS_TOKEN`, `GITHUB_TOOLSETS`,
//!    `MCP_SERVER_IMAGE`).
//!
//! Secrets live only in `env` and are passed to the child through its
//! environment, never through argv or the log.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::mcp_client::McpError;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_PATH_ENV: &str = "MCP_BRIDGE_CONFIG";

const TOKEN_ENV: &str = "GITHUB_PERSONAL_ACCESS_TOKEN";
const TOOLSETS_ENV: &str = "GITHUB_TOOLSETS";
const IMAGE_ENV: &str = "MCP_SERVER_IMAGE";

const DEFAULT_TOOLSETS: &str = "repos,issues,pull_requests,projects";
const DEFAULT_IMAGE: &str = "ghcr.io/github/github-mcp-server:0.30.3";

// ─── BridgeConfig ────────────────────────────────────────────────────────────

/// How to launch and talk to the wrapped MCP server.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Label used in logs and error messages.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Variables set on the child. May contain secrets.
    pub env: HashMap<String, String>,
    /// Variables copied from the bridge's own environment, if present.
    pub inherit_env: Vec<String>,
    pub cwd: Option<String>,
    pub call_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub settle_delay_ms: u64,
    /// Consecutive failed starts allowed before calls fail fast.
    pub max_restart_attempts: u32,
    pub protocol_version: String,
    pub client_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "github".into(),
            command: "docker".into(),
            args: docker_args(DEFAULT_IMAGE),
            env: HashMap::new(),
            inherit_env: default_inherit_env(),
            cwd: None,
            call_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            settle_delay_ms: 500,
            max_restart_attempts: 3,
            protocol_version: "2024-11-05".into(),
            client_name: "mcp-bridge".into(),
        }
    }
}

/// `env` values are redacted; only the keys are shown.
impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut env_keys: Vec<&String> = self.env.keys().collect();
        env_keys.sort();
        f.debug_struct("BridgeConfig")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("inherit_env", &self.inherit_env)
            .field("cwd", &self.cwd)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("init_timeout_ms", &self.init_timeout_ms)
            .field("shutdown_grace_ms", &self.shutdown_grace_ms)
            .field("settle_delay_ms", &self.settle_delay_ms)
            .field("max_restart_attempts", &self.max_restart_attempts)
            .field("protocol_version", &self.protocol_version)
            .field("client_name", &self.client_name)
            .finish()
    }
}

fn default_inherit_env() -> Vec<String> {
    ["PATH", "HOME", "TMPDIR", "DOCKER_HOST", "DOCKER_CONFIG", "XDG_RUNTIME_DIR"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `docker run` in stdio mode. `-e NAME` forwards the variable from the
/// docker client's environment, so secret values stay out of argv.
fn docker_args(image: &str) -> Vec<String> {
    [
        "run",
        "-i",
        "--rm",
        "-e",
        TOKEN_ENV,
        "-e",
        TOOLSETS_ENV,
        image,
        "stdio",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl BridgeConfig {
    /// Build the GitHub-over-Docker config from the process environment.
    pub fn from_env() -> Result<Self, McpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, McpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup(TOKEN_ENV)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("{TOKEN_ENV} is not set"),
            })?;
        let toolsets = lookup(TOOLSETS_ENV).unwrap_or_else(|| DEFAULT_TOOLSETS.to_string());
        let image = lookup(IMAGE_ENV).unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let mut env = HashMap::new();
        env.insert(TOKEN_ENV.to_string(), token);
        env.insert(TOOLSETS_ENV.to_string(), toolsets);

        let config = Self {
            args: docker_args(&image),
            env,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that could never produce a working session.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "command must not be empty".into(),
            });
        }
        for (field, value) in [
            ("call_timeout_ms", self.call_timeout_ms),
            ("init_timeout_ms", self.init_timeout_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
        ] {
            if value == 0 {
                return Err(McpError::ConfigError {
                    reason: format!("{field} must be greater than zero"),
                });
            }
        }
        if self.max_restart_attempts == 0 {
            return Err(McpError::ConfigError {
                reason: "max_restart_attempts must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Masked form of the access token for logging, if one is configured.
    pub fn masked_token(&self) -> Option<String> {
        self.env.get(TOKEN_ENV).map(|t| mask_secret(t))
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse a YAML bridge config.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_bridge_config(path: &Path) -> Result<BridgeConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = expand_vars(&raw, |name| std::env::var(name).ok());

    let config: BridgeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

/// Resolve the effective config: the YAML file if `MCP_BRIDGE_CONFIG` is set,
/// otherwise the environment.
pub fn resolve_config() -> Result<BridgeConfig, McpError> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => {
            let path = expand_home(path.trim());
            tracing::info!(path = %path, "loading bridge config file");
            load_bridge_config(Path::new(&path))
        }
        _ => BridgeConfig::from_env(),
    }
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{tail}")
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}` using `lookup`.
///
/// An unset `VAR` without a default becomes empty. A default may start with
/// `~`. An unterminated `${` is left as written.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        let Some(close) = rest[open + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);

        let expr = &rest[open + 2..open + 2 + close];
        let value = match expr.split_once(":-") {
            Some((name, default)) => lookup(name).unwrap_or_else(|| expand_home(default)),
            None => lookup(expr).unwrap_or_default(),
        };
        out.push_str(&value);
        rest = &rest[open + 2 + close + 1..];
    }

    out.push_str(rest);
    out
}

/// `~` or `~/...` relative to the home directory. `~user` is not expanded.
fn expand_home(path: &str) -> String {
    let relative = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) => match rest.strip_prefix('/') {
            Some(rest) => rest,
            None => return path.to_string(),
        },
        None => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) if relative.is_empty() => home.display().to_string(),
        Some(home) => home.join(relative).display().to_string(),
        None => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
