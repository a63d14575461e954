//! Configuration management.
//!
//! Grounded on the teacher's `Config::load` (figment: YAML file merged with
//! `<PREFIX>_`-prefixed env overrides, then env-file loading for `~`-expanded
//! dotenv paths), retargeted from the teacher's gateway/backend sections to
//! Sentinel's policy/approval/break-glass/server/audit sections. The
//! teacher's `${VAR}` backend-header expansion and `humantime_serde`
//! duration formatting have no counterpart here — Sentinel's config has no
//! per-backend headers to template, and its few durations are plain
//! `chrono::Duration` fields embedded in [`crate::store::approval::ApprovalPolicy`]
//! and [`crate::store::breakglass::BreakGlassPolicy`], (de)serialized as
//! integer seconds via [`crate::store::duration_seconds`] (`chrono`'s own
//! serde support covers `DateTime`, not `Duration`).

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};

use crate::store::approval::ApprovalPolicy;
use crate::store::breakglass::BreakGlassPolicy;
use crate::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config. Paths support
    /// `~` expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Credential-server bind configuration.
    pub server: ServerConfig,
    /// Signed-policy source configuration.
    pub policy: PolicyConfig,
    /// Approval authority policy (who may approve which profiles).
    pub approval: ApprovalPolicy,
    /// Break-glass authorization policy and rate limits.
    pub breakglass: BreakGlassPolicy,
    /// Audit log HMAC key provisioning.
    pub audit: AuditConfig,
    /// MFA configuration (TOTP enrollment store path, SMS sender settings).
    pub mfa: MfaConfig,
    /// Issuer configuration (upstream identity source / role-assumer wiring).
    pub issuer: IssuerConfig,
    /// Log level (`trace`, `debug`, `info`, `warn`, `error`).
    pub log_level: String,
    /// Log format (`pretty`, `json`); `None` defers to `tracing_subscriber`'s
    /// own default.
    #[serde(default)]
    pub log_format: Option<String>,
}

/// Where and how the local credential server (C12) binds. Per spec §9 the
/// choice between a Unix domain socket and loopback TCP is a deployer
/// decision: Unix is preferred where available (peer-credential binding is
/// strongest there), TCP is the portable fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum BindConfig {
    /// Loopback TCP, guarded by `Host` header allowlisting.
    Tcp {
        host: String,
        port: u16,
    },
    /// Unix domain socket, guarded by peer uid/pid.
    Unix {
        path: String,
    },
}

impl Default for BindConfig {
    fn default() -> Self {
        Self::Tcp {
            host: "127.0.0.1".to_string(),
            port: 39717,
        }
    }
}

/// Credential-server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: BindConfig,
    /// `Host` header allowlist, consulted only on the TCP transport (spec
    /// §4.11 DNS-rebinding guard).
    pub allowed_hosts: Vec<String>,
    /// Identifies this process in registered server sessions (spec §3
    /// entity S `server_instance_id`).
    pub server_instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: BindConfig::default(),
            allowed_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            server_instance_id: "sentinel-0".to_string(),
        }
    }
}

/// Signed-policy source configuration (spec §4.1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Key/parameter name the policy blob and its detached `.sig` sibling
    /// are stored under in the remote KV source.
    pub source_key: String,
    /// Directory backing the local/dev [`crate::policy::loader::FilePolicySource`]
    /// (`source_key` resolves to `<source_dir>/<source_key>`).
    pub source_dir: String,
    /// Filesystem path to the RSA public key used to verify the detached
    /// signature. Spec §6: "fetched from a separate, non-writable path".
    pub public_key_path: String,
    /// How often the background reloader polls the source for a changed
    /// policy, in seconds.
    pub reload_interval_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source_key: "sentinel/policy".to_string(),
            source_dir: "/etc/sentinel/policy-store".to_string(),
            public_key_path: "/etc/sentinel/policy-verify.pub".to_string(),
            reload_interval_secs: 30,
        }
    }
}

/// Audit HMAC key provisioning (spec §4.7; §6 "`sig` field carries base64
/// HMAC-SHA256").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub key_id: String,
    /// Filesystem path to the raw HMAC key bytes.
    pub key_path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            key_id: "sentinel-audit-0".to_string(),
            key_path: "/etc/sentinel/audit.key".to_string(),
        }
    }
}

/// MFA configuration (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Filesystem path to the durable TOTP enrollment store (user ->
    /// base32 secret).
    pub totp_store_path: String,
    /// Whether the SMS fallback variant is enabled.
    pub sms_enabled: bool,
    /// Identifier of the configured SMS sender (spec §4.9's `SmsSender`
    /// trait is opaque; this just selects which implementation to wire up).
    pub sms_sender: String,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            totp_store_path: "/etc/sentinel/totp-enrollments.json".to_string(),
            sms_enabled: false,
            sms_sender: "noop".to_string(),
        }
    }
}

/// Credential-issuer configuration (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Identifier of the configured `IdentitySource` implementation.
    pub identity_source: String,
    /// Identifier of the configured `RoleAssumer` implementation.
    pub role_assumer: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            identity_source: "sso".to_string(),
            role_assumer: "sts".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!("config file not found: {}", p.display())));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SENTINEL_").split("__"));

        let config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;
        config.load_env_files();
        Ok(config)
    }

    /// Load each configured env file into the process environment via
    /// `dotenvy`, `~`-expanding the path first. Files that don't exist are
    /// silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("env file not found (skipped): {expanded}");
            }
        }
    }
}
