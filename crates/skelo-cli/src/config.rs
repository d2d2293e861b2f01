//! Configuration file management for skelo.
//!
//! Provides a TOML-based config file at `~/.config/skelo/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use skelo_core::adapter::cli::{CliAdapter, CliAdapterConfig};
use skelo_core::adapter::http::{HttpAdapter, HttpAdapterConfig};
use skelo_core::adapter::Adapter;
use skelo_core::dispatcher::{DispatcherConfig, WipLimits};
use skelo_core::watchdog::{RecoveryAction, WatchdogConfig};
use skelo_db::config::DbConfig;
use skelo_db::models::GateSpec;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub adapters: Vec<AdapterSection>,
    /// Per-type WIP caps; the `default` key caps unlisted types.
    #[serde(default)]
    pub wip_limits: HashMap<String, usize>,
    #[serde(default)]
    pub leases: LeasesSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub server: ServerSection,
    /// Webhook URLs notified of task events.
    #[serde(default)]
    pub webhooks: Vec<String>,
    /// Default gates per task type.
    #[serde(default)]
    pub gates: HashMap<String, Vec<GateSpec>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Cli,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSection {
    pub name: String,
    pub kind: AdapterKind,
    #[serde(default = "default_task_types")]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_adapter_timeout")]
    pub timeout_seconds: u64,
}

fn default_task_types() -> Vec<String> {
    vec!["task".to_owned()]
}

fn default_adapter_timeout() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasesSection {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_grace")]
    pub grace_period_seconds: u64,
}

fn default_ttl() -> u64 {
    600
}
fn default_heartbeat() -> u64 {
    60
}
fn default_grace() -> u64 {
    120
}

impl Default for LeasesSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            heartbeat_interval_seconds: default_heartbeat(),
            grace_period_seconds: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_poll")]
    pub poll_interval_seconds: u64,
}

fn default_poll() -> u64 {
    5
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_watchdog_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub on_lease_expire: RecoveryAction,
}

fn default_watchdog_interval() -> u64 {
    30
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_watchdog_interval(),
            on_lease_expire: RecoveryAction::Requeue,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_port() -> u16 {
    7077
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the skelo config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/skelo` or `~/.config/skelo`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("skelo");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("skelo")
}

/// Return the path to the skelo config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

/// Generate a random API key: 32 random bytes, hex-encoded.
pub fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
pub struct SkeloConfig {
    pub db_config: DbConfig,
    pub dispatcher: DispatcherConfig,
    pub watchdog: WatchdogConfig,
    pub server: ServerSection,
    pub adapters: Vec<Arc<dyn Adapter>>,
    pub webhooks: Vec<String>,
}

impl SkeloConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    pub fn resolve(cli_db_path: Option<&str>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let db_path = if let Some(path) = cli_db_path {
            path.to_owned()
        } else if let Ok(path) = std::env::var("SKELO_DB_PATH") {
            path
        } else if let Some(ref path) = file.db_path {
            path.clone()
        } else {
            DbConfig::DEFAULT_PATH.to_owned()
        };

        let mut server = file.server.clone();
        if let Ok(key) = std::env::var("SKELO_API_KEY") {
            server.api_key = Some(key);
        }

        let mut per_type = file.wip_limits.clone();
        let default_limit = per_type.remove("default").unwrap_or(1);

        let dispatcher = DispatcherConfig {
            poll_interval: Duration::from_secs(file.dispatcher.poll_interval_seconds),
            lease_ttl: Duration::from_secs(file.leases.ttl_seconds),
            heartbeat_interval: Duration::from_secs(file.leases.heartbeat_interval_seconds),
            wip_limits: WipLimits {
                per_type,
                default_limit,
            },
            default_gates: file.gates.clone(),
        };

        let watchdog = WatchdogConfig {
            interval: Duration::from_secs(file.watchdog.interval_seconds),
            grace_period: Duration::from_secs(file.leases.grace_period_seconds),
            on_lease_expire: file.watchdog.on_lease_expire,
        };

        let adapters = file
            .adapters
            .iter()
            .map(build_adapter)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            db_config: DbConfig::new(db_path),
            dispatcher,
            watchdog,
            server,
            adapters,
            webhooks: file.webhooks,
        })
    }
}

fn build_adapter(section: &AdapterSection) -> Result<Arc<dyn Adapter>> {
    let timeout = Duration::from_secs(section.timeout_seconds);
    match section.kind {
        AdapterKind::Cli => {
            let Some(ref command) = section.command else {
                bail!("adapter {:?} is kind cli but has no command", section.name);
            };
            Ok(Arc::new(CliAdapter::new(CliAdapterConfig {
                name: section.name.clone(),
                task_types: section.task_types.clone(),
                command: command.clone(),
                args: section.args.clone(),
                cwd: section.cwd.clone().map(PathBuf::from),
                env: section.env.clone(),
                timeout,
            })))
        }
        AdapterKind::Http => {
            let Some(ref url) = section.url else {
                bail!("adapter {:?} is kind http but has no url", section.name);
            };
            Ok(Arc::new(HttpAdapter::new(HttpAdapterConfig {
                name: section.name.clone(),
                task_types: section.task_types.clone(),
                url: url.clone(),
                model: section.model.clone(),
                api_key: section.api_key.clone(),
                timeout,
            })))
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_api_key_is_64_hex_chars() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_api_key_is_random() {
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ConfigFile = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.server.port, 7077);
        assert_eq!(config.leases.ttl_seconds, 600);
        assert_eq!(config.dispatcher.poll_interval_seconds, 5);
        assert_eq!(config.watchdog.on_lease_expire, RecoveryAction::Requeue);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let toml_str = r#"
db_path = "/var/lib/skelo/state.db"
webhooks = ["http://localhost:9999/hook"]

[wip_limits]
default = 2
code = 4

[leases]
ttl_seconds = 300
heartbeat_interval_seconds = 30
grace_period_seconds = 60

[dispatcher]
poll_interval_seconds = 2

[watchdog]
interval_seconds = 10
on_lease_expire = "block"

[server]
host = "0.0.0.0"
port = 8088
api_key = "secret"

[[adapters]]
name = "claude"
kind = "cli"
task_types = ["code", "research"]
command = "claude"
args = ["-p"]

[[adapters]]
name = "completion"
kind = "http"
url = "http://localhost:8000/complete"
model = "small"

[[gates.code]]
type = "word_count"
min = 1
"#;
        let config: ConfigFile = toml::from_str(toml_str).expect("should parse");
        assert_eq!(config.db_path.as_deref(), Some("/var/lib/skelo/state.db"));
        assert_eq!(config.wip_limits["code"], 4);
        assert_eq!(config.watchdog.on_lease_expire, RecoveryAction::Block);
        assert_eq!(config.adapters.len(), 2);
        assert_eq!(config.adapters[0].kind, AdapterKind::Cli);
        assert_eq!(config.adapters[1].kind, AdapterKind::Http);
        assert_eq!(config.gates["code"].len(), 1);
    }

    #[test]
    fn cli_adapter_requires_command() {
        let section = AdapterSection {
            name: "broken".into(),
            kind: AdapterKind::Cli,
            task_types: default_task_types(),
            command: None,
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
            url: None,
            model: None,
            api_key: None,
            timeout_seconds: 60,
        };
        assert!(build_adapter(&section).is_err());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("skelo/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
