use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Tunable daemon parameters.
///
/// Loops take a fresh snapshot from the [`SettingsManager`] at the start of
/// every iteration; a snapshot is never cached across iterations, so tuning
/// changes take effect on the next batch window or report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodpingSettings {
    /// Batch window length in seconds. Doubles as the dequeue timeout inside
    /// a window; matches the chain's block production cadence.
    #[serde(default = "default_hive_operation_period")]
    pub hive_operation_period: u64,
    /// Projected JSON payload size at which a batch window closes early,
    /// in bytes.
    #[serde(default = "default_max_url_list_bytes")]
    pub max_url_list_bytes: usize,
    /// Seconds between diagnostic status reports.
    #[serde(default = "default_diagnostic_report_period")]
    pub diagnostic_report_period: u64,
    /// Seconds between re-checks of the allowed-account set.
    #[serde(default = "default_control_account_check_period")]
    pub control_account_check_period: u64,
    /// Account whose follow list defines who may publish podpings.
    #[serde(default = "default_control_account")]
    pub control_account: String,
}

fn default_hive_operation_period() -> u64 {
    3
}

fn default_max_url_list_bytes() -> usize {
    8000
}

fn default_diagnostic_report_period() -> u64 {
    180
}

fn default_control_account_check_period() -> u64 {
    180
}

fn default_control_account() -> String {
    "podping".to_string()
}

impl Default for PodpingSettings {
    fn default() -> Self {
        Self {
            hive_operation_period: default_hive_operation_period(),
            max_url_list_bytes: default_max_url_list_bytes(),
            diagnostic_report_period: default_diagnostic_report_period(),
            control_account_check_period: default_control_account_check_period(),
            control_account: default_control_account(),
        }
    }
}

impl PodpingSettings {
    fn normalize(&mut self) {
        if self.hive_operation_period == 0 {
            self.hive_operation_period = default_hive_operation_period();
        }
        if self.max_url_list_bytes == 0 {
            self.max_url_list_bytes = default_max_url_list_bytes();
        }
        if self.diagnostic_report_period == 0 {
            self.diagnostic_report_period = default_diagnostic_report_period();
        }
        if self.control_account_check_period == 0 {
            self.control_account_check_period = default_control_account_check_period();
        }
        self.control_account = self.control_account.trim().to_string();
        if self.control_account.is_empty() {
            self.control_account = default_control_account();
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Default location of the settings overrides file.
pub fn settings_overrides_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("podping").join("settings.json"))
}

/// Load settings from an overrides file, or `None` when the file is absent.
pub fn load_settings(path: &Path) -> anyhow::Result<Option<PodpingSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: PodpingSettings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

/// Persist settings to `path` atomically (write-temp-then-rename).
pub fn save_settings(path: &Path, settings: &PodpingSettings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Shared source of [`PodpingSettings`] snapshots.
///
/// Readers call [`SettingsManager::get`] per loop iteration; a future
/// chain-backed refresher can push updates through
/// [`SettingsManager::replace`] without touching the loops.
#[derive(Debug)]
pub struct SettingsManager {
    current: RwLock<PodpingSettings>,
}

impl SettingsManager {
    /// Create a manager seeded with `initial` (normalized).
    pub fn new(mut initial: PodpingSettings) -> Self {
        initial.normalize();
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Snapshot the current settings.
    pub async fn get(&self) -> PodpingSettings {
        self.current.read().await.clone()
    }

    /// Replace the current settings (normalized) for subsequent snapshots.
    pub async fn replace(&self, mut settings: PodpingSettings) {
        settings.normalize();
        *self.current.write().await = settings;
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new(PodpingSettings::default())
    }
}
