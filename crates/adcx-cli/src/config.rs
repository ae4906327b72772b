//! Configuration file for the CLI.

use adcx_proto::Pid;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Hub connection settings.
    #[serde(default)]
    pub hubs: HubConfig,
    /// Share settings.
    #[serde(default)]
    pub share: ShareConfig,
    /// Upload settings.
    #[serde(default)]
    pub uploads: UploadSection,
}

/// Identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Private ID in base32; generated and persisted on first run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    /// Nick presented to hubs.
    #[serde(default = "default_nick")]
    pub nick: String,
    /// Description field.
    #[serde(default)]
    pub description: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            pid: None,
            nick: default_nick(),
            description: String::new(),
        }
    }
}

/// Hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hubs joined at startup.
    #[serde(default)]
    pub autoconnect: Vec<String>,
    /// Reconnect after failures.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Accept untrusted hub certificates.
    #[serde(default)]
    pub allow_untrusted: bool,
    /// TCP listen port for user connections (0 disables).
    #[serde(default)]
    pub tcp_port: u16,
    /// UDP search port (0 disables).
    #[serde(default)]
    pub udp_port: u16,
    /// Externally visible IPv4 address.
    #[serde(default)]
    pub external_ip4: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            autoconnect: Vec::new(),
            auto_reconnect: true,
            allow_untrusted: false,
            tcp_port: 0,
            udp_port: 0,
            external_ip4: String::new(),
        }
    }
}

/// Share settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShareConfig {
    /// Shared directories: real path → virtual name.
    #[serde(default)]
    pub roots: Vec<ShareRootConfig>,
    /// Skiplist glob patterns, `;`-separated.
    #[serde(default)]
    pub skiplist: String,
    /// Paths never shared.
    #[serde(default)]
    pub excluded: Vec<PathBuf>,
}

/// One shared directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRootConfig {
    /// Real filesystem path.
    pub path: PathBuf,
    /// Virtual name; defaults to the directory name.
    #[serde(default)]
    pub name: String,
    /// Picked up by incoming-only refreshes.
    #[serde(default)]
    pub incoming: bool,
}

/// Upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSection {
    /// Standard slot count.
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// Mini-file extra slots.
    #[serde(default = "default_extra_slots")]
    pub extra_slots: u32,
    /// Mini-slot size threshold in KiB.
    #[serde(default = "default_minislot_kib")]
    pub minislot_kib: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        UploadSection {
            slots: default_slots(),
            extra_slots: default_extra_slots(),
            minislot_kib: default_minislot_kib(),
        }
    }
}

fn default_nick() -> String {
    "adcx-user".into()
}

fn default_true() -> bool {
    true
}

fn default_slots() -> u32 {
    2
}

fn default_extra_slots() -> u32 {
    3
}

fn default_minislot_kib() -> u64 {
    512
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load, or create a default config (with a fresh PID) at `path`.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.identity.pid = Some(Pid::generate().to_base32());
        config.save(path)?;
        Ok(config)
    }

    /// Persist to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("writing config {}", path.display()))
    }

    /// Decode the stored PID, generating one when absent.
    pub fn pid(&self) -> anyhow::Result<Pid> {
        match &self.identity.pid {
            Some(text) => Pid::from_base32(text).map_err(|e| anyhow::anyhow!("bad pid: {e}")),
            None => Ok(Pid::generate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_config_with_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let created = Config::load_or_init(&path).unwrap();
        assert!(created.identity.pid.is_some());
        assert!(path.exists());

        // Second load returns the same identity.
        let loaded = Config::load_or_init(&path).unwrap();
        assert_eq!(created.identity.pid, loaded.identity.pid);
        assert_eq!(
            created.pid().unwrap().derive_cid(),
            loaded.pid().unwrap().derive_cid()
        );
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.identity.nick, "adcx-user");
        assert!(config.hubs.auto_reconnect);
        assert_eq!(config.uploads.slots, 2);
    }
}
