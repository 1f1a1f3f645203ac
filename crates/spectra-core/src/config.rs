use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (spectra.toml + SPECTRA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectraConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// One set of Telegram API credentials. `session_handle` is the canonical
/// account identifier everywhere in SPECTRA; `phone` is display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub session_handle: String,
    pub phone: Option<String>,
    pub password: Option<String>,
}

impl AccountConfig {
    /// The identifier stored in the channel-access table: the phone number
    /// when configured, the session handle otherwise.
    pub fn phone_or_handle(&self) -> &str {
        self.phone.as_deref().unwrap_or(&self.session_handle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_kind")]
    pub kind: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Optional port list for single-host-many-ports rotation. When empty,
    /// `port` is the only endpoint.
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationMode {
    #[default]
    Sequential,
    Random,
    LeastUsed,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    /// Re-select an account before every operation.
    #[default]
    PerOperation,
    /// Keep the active account until it fails.
    Sticky,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RotationConfig {
    #[serde(default)]
    pub mode: RotationMode,
    #[serde(default)]
    pub policy: RotationPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub download_media: bool,
    #[serde(default = "bool_true")]
    pub download_avatars: bool,
    #[serde(default)]
    pub archive_topics: bool,
    /// When non-empty, only media whose MIME type is listed is saved.
    #[serde(default)]
    pub media_mime_whitelist: Vec<String>,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: u32,
    /// Seconds slept between message batches.
    #[serde(default = "default_fetch_wait")]
    pub fetch_wait: u64,
    /// Stop after this many messages per pass; 0 = unlimited.
    #[serde(default)]
    pub fetch_limit: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            download_media: false,
            download_avatars: true,
            archive_topics: false,
            media_mime_whitelist: Vec::new(),
            fetch_batch_size: default_fetch_batch_size(),
            fetch_wait: default_fetch_wait(),
            fetch_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "bool_true")]
    pub enable_deduplication: bool,
    /// Unique (first-seen) messages are additionally forwarded here.
    pub secondary_unique_destination: Option<String>,
    /// Fallback destination when an operation supplies none.
    pub default_destination_id: Option<String>,
    #[serde(default)]
    pub forward_to_all_saved_messages: bool,
    #[serde(default)]
    pub prepend_origin_info: bool,
    pub destination_topic_id: Option<i64>,
    /// Skip messages without media before hashing.
    #[serde(default = "bool_true")]
    pub attachments_only: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            secondary_unique_destination: None,
            default_destination_id: None,
            forward_to_all_saved_messages: false,
            prepend_origin_info: false,
            destination_topic_id: None,
            attachments_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloudConfig {
    #[serde(default)]
    pub auto_invite_accounts: bool,
    #[serde(default)]
    pub invitation_delays: InvitationDelays,
}

/// Delay window for the invitation queue. The actual pause is
/// `uniform(min, max) * uniform(1 - variance, 1 + variance)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationDelays {
    #[serde(default = "default_invite_min")]
    pub min_seconds: u64,
    #[serde(default = "default_invite_max")]
    pub max_seconds: u64,
    #[serde(default = "default_invite_variance")]
    pub variance: f64,
}

impl Default for InvitationDelays {
    fn default() -> Self {
        Self {
            min_seconds: default_invite_min(),
            max_seconds: default_invite_max(),
            variance: default_invite_variance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between archive passes.
    #[serde(default = "default_archive_interval")]
    pub archive_interval_secs: u64,
    /// Seconds between priority recomputations (slower cadence).
    #[serde(default = "default_network_interval")]
    pub network_refresh_interval_secs: u64,
    /// Discovered groups below this priority are not auto-archived.
    #[serde(default)]
    pub priority_threshold: f64,
    /// Static channel list; when empty, priority targets are used instead.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_top_targets")]
    pub max_priority_targets: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            archive_interval_secs: default_archive_interval(),
            network_refresh_interval_secs: default_network_interval(),
            priority_threshold: 0.0,
            channels: Vec::new(),
            max_priority_targets: default_top_targets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
    #[serde(default = "default_invitation_state")]
    pub invitation_state_file: String,
    /// Optional IANA timezone used for timeline display grouping.
    pub display_timezone: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            media_dir: default_media_dir(),
            invitation_state_file: default_invitation_state(),
            display_timezone: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_proxy_kind() -> String {
    "socks5".to_string()
}
fn default_fetch_batch_size() -> u32 {
    2000
}
fn default_fetch_wait() -> u64 {
    5
}
fn default_invite_min() -> u64 {
    120
}
fn default_invite_max() -> u64 {
    600
}
fn default_invite_variance() -> f64 {
    0.3
}
fn default_archive_interval() -> u64 {
    3600
}
fn default_network_interval() -> u64 {
    6 * 3600
}
fn default_top_targets() -> usize {
    10
}
fn default_db_path() -> String {
    "spectra_data/spectra.db".to_string()
}
fn default_media_dir() -> String {
    "spectra_data/media".to_string()
}
fn default_invitation_state() -> String {
    "spectra_data/invitation_state.json".to_string()
}

impl Default for SpectraConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            proxy: None,
            rotation: RotationConfig::default(),
            archive: ArchiveConfig::default(),
            forwarding: ForwardingConfig::default(),
            cloud: CloudConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl SpectraConfig {
    /// Load config from a TOML file with SPECTRA_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("spectra.toml");

        let config: SpectraConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPECTRA_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Accounts with the fields required to open a session.
    pub fn usable_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts
            .iter()
            .filter(|a| !a.api_hash.is_empty() && !a.session_handle.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SpectraConfig::default();
        assert!(!cfg.archive.download_media);
        assert!(cfg.archive.download_avatars);
        assert_eq!(cfg.archive.fetch_batch_size, 2000);
        assert_eq!(cfg.archive.fetch_wait, 5);
        assert_eq!(cfg.archive.fetch_limit, 0);
        assert!(cfg.forwarding.enable_deduplication);
        assert!(cfg.forwarding.attachments_only);
        assert_eq!(cfg.cloud.invitation_delays.min_seconds, 120);
        assert_eq!(cfg.rotation.mode, RotationMode::Sequential);
    }

    #[test]
    fn rotation_mode_kebab_case() {
        let mode: RotationMode = serde_json::from_str("\"least-used\"").unwrap();
        assert_eq!(mode, RotationMode::LeastUsed);
        let policy: RotationPolicy = serde_json::from_str("\"per-operation\"").unwrap();
        assert_eq!(policy, RotationPolicy::PerOperation);
    }

    #[test]
    fn phone_or_handle_falls_back() {
        let acc = AccountConfig {
            api_id: 1,
            api_hash: "h".into(),
            session_handle: "alpha".into(),
            phone: None,
            password: None,
        };
        assert_eq!(acc.phone_or_handle(), "alpha");
    }
}
