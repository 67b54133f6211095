//! Persistent SSH host key store.
//!
//! Server key fingerprints are remembered per `host:port` in a JSON file at
//! `~/.config/shellmux/known_hosts.json`. A [`HostKeyPolicy`] decides what to
//! do with keys the store has never seen or that no longer match.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How to treat server host keys during the SSH handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept every key without recording it.
    AcceptAny,
    /// Record unknown keys, reject keys that changed.
    #[default]
    TrustFirstUse,
    /// Accept only keys already in the store.
    Strict,
}

/// What the store knows about a presented key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The fingerprint matches the stored one.
    Known,
    /// No key is stored for this host.
    Unknown,
    /// A different key is stored for this host.
    Mismatch { expected: String },
}

/// Outcome of applying a [`HostKeyPolicy`] to a [`HostKeyStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Continue the handshake.
    Accept,
    /// Continue the handshake and record the key.
    AcceptAndRecord,
    /// Abort the handshake.
    Reject(String),
}

impl HostKeyPolicy {
    /// Applies the policy to a lookup result.
    pub fn evaluate(self, status: &HostKeyStatus) -> HostKeyDecision {
        match (self, status) {
            (HostKeyPolicy::AcceptAny, _) => HostKeyDecision::Accept,
            (_, HostKeyStatus::Known) => HostKeyDecision::Accept,
            (HostKeyPolicy::TrustFirstUse, HostKeyStatus::Unknown) => {
                HostKeyDecision::AcceptAndRecord
            }
            (HostKeyPolicy::Strict, HostKeyStatus::Unknown) => {
                HostKeyDecision::Reject("host is not in the known hosts store".to_string())
            }
            (_, HostKeyStatus::Mismatch { expected }) => HostKeyDecision::Reject(format!(
                "host key changed, expected {expected}"
            )),
        }
    }
}

impl std::fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostKeyPolicy::AcceptAny => "accept-any",
            HostKeyPolicy::TrustFirstUse => "trust-first-use",
            HostKeyPolicy::Strict => "strict",
        };
        f.write_str(name)
    }
}

/// A remembered host key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownHost {
    /// Host name or address as the user typed it.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// SHA-256 fingerprint of the server key.
    pub fingerprint: String,
    /// When the key was first recorded.
    pub first_seen: SystemTime,
    /// When the key was last presented.
    pub last_seen: SystemTime,
}

impl KnownHost {
    /// Creates a new entry seen now.
    pub fn new(host: impl Into<String>, port: u16, fingerprint: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            host: host.into(),
            port,
            fingerprint: fingerprint.into(),
            first_seen: now,
            last_seen: now,
        }
    }

    fn key(&self) -> String {
        host_key(&self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KnownHostsData {
    version: u32,
    hosts: Vec<KnownHost>,
}

impl Default for KnownHostsData {
    fn default() -> Self {
        Self {
            version: 1,
            hosts: Vec::new(),
        }
    }
}

/// Thread-safe store of host key fingerprints.
pub struct KnownHostsStore {
    path: PathBuf,
    hosts: RwLock<HashMap<String, KnownHost>>,
}

impl KnownHostsStore {
    /// Creates a store that persists to `path`.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store at `~/.config/shellmux/known_hosts.json`.
    pub fn with_default_path() -> Self {
        Self::new(default_known_hosts_path())
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads entries from disk. A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Known hosts file not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read known hosts: {}", self.path.display()))?;

        let data: KnownHostsData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse known hosts: {}", self.path.display()))?;

        let mut hosts = self
            .hosts
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on known hosts"))?;

        hosts.clear();
        for host in data.hosts {
            hosts.insert(host.key(), host);
        }

        tracing::info!("Loaded {} known hosts from {:?}", hosts.len(), self.path);
        Ok(())
    }

    /// Writes entries to disk atomically, creating parent directories.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create known hosts directory: {}", parent.display())
            })?;
        }

        let hosts = self
            .hosts
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on known hosts"))?;

        let mut entries: Vec<KnownHost> = hosts.values().cloned().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        let data = KnownHostsData {
            version: 1,
            hosts: entries,
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize known hosts")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp known hosts: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp known hosts {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} known hosts to {:?}", hosts.len(), self.path);
        Ok(())
    }

    /// Looks up `fingerprint` for `host:port`.
    pub fn check(&self, host: &str, port: u16, fingerprint: &str) -> Result<HostKeyStatus> {
        let hosts = self
            .hosts
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on known hosts"))?;

        Ok(match hosts.get(&host_key(host, port)) {
            None => HostKeyStatus::Unknown,
            Some(entry) if entry.fingerprint == fingerprint => HostKeyStatus::Known,
            Some(entry) => HostKeyStatus::Mismatch {
                expected: entry.fingerprint.clone(),
            },
        })
    }

    /// Records or replaces the key for a host.
    ///
    /// Does not automatically save; call `save()` after making changes.
    pub fn add(&self, entry: KnownHost) -> Result<()> {
        let mut hosts = self
            .hosts
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on known hosts"))?;

        tracing::info!(
            host = %entry.host,
            port = entry.port,
            fingerprint = %entry.fingerprint,
            "Recording host key"
        );
        hosts.insert(entry.key(), entry);
        Ok(())
    }

    /// Refreshes the last-seen time of a known host. Unknown hosts are ignored.
    pub fn touch(&self, host: &str, port: u16) -> Result<()> {
        let mut hosts = self
            .hosts
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on known hosts"))?;

        if let Some(entry) = hosts.get_mut(&host_key(host, port)) {
            entry.last_seen = SystemTime::now();
        }
        Ok(())
    }

    /// Forgets the key for a host, returning it if present.
    pub fn remove(&self, host: &str, port: u16) -> Result<Option<KnownHost>> {
        let mut hosts = self
            .hosts
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on known hosts"))?;

        Ok(hosts.remove(&host_key(host, port)))
    }

    /// Lists every remembered host.
    pub fn list(&self) -> Result<Vec<KnownHost>> {
        let hosts = self
            .hosts
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on known hosts"))?;

        Ok(hosts.values().cloned().collect())
    }

    /// Returns the number of remembered hosts.
    pub fn len(&self) -> usize {
        self.hosts.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Returns true if no hosts are remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn host_key(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_ascii_lowercase(), port)
}

/// Returns `~/.config/shellmux/known_hosts.json`.
pub fn default_known_hosts_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("known_hosts.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store(temp_dir: &TempDir) -> KnownHostsStore {
        KnownHostsStore::new(temp_dir.path().join("known_hosts.json"))
    }

    #[test]
    fn test_policy_default() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::TrustFirstUse);
    }

    #[test]
    fn test_policy_serialization() {
        let json = serde_json::to_string(&HostKeyPolicy::AcceptAny).unwrap();
        assert_eq!(json, "\"accept-any\"");
        let parsed: HostKeyPolicy = serde_json::from_str("\"trust-first-use\"").unwrap();
        assert_eq!(parsed, HostKeyPolicy::TrustFirstUse);
        assert_eq!(HostKeyPolicy::Strict.to_string(), "strict");
    }

    #[test]
    fn test_policy_evaluate() {
        let mismatch = HostKeyStatus::Mismatch {
            expected: "SHA256:old".to_string(),
        };

        assert_eq!(
            HostKeyPolicy::AcceptAny.evaluate(&mismatch),
            HostKeyDecision::Accept
        );
        assert_eq!(
            HostKeyPolicy::TrustFirstUse.evaluate(&HostKeyStatus::Unknown),
            HostKeyDecision::AcceptAndRecord
        );
        assert_eq!(
            HostKeyPolicy::TrustFirstUse.evaluate(&HostKeyStatus::Known),
            HostKeyDecision::Accept
        );
        assert!(matches!(
            HostKeyPolicy::TrustFirstUse.evaluate(&mismatch),
            HostKeyDecision::Reject(reason) if reason.contains("SHA256:old")
        ));
        assert!(matches!(
            HostKeyPolicy::Strict.evaluate(&HostKeyStatus::Unknown),
            HostKeyDecision::Reject(_)
        ));
        assert_eq!(
            HostKeyPolicy::Strict.evaluate(&HostKeyStatus::Known),
            HostKeyDecision::Accept
        );
    }

    #[test]
    fn test_check_statuses() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);

        assert_eq!(
            store.check("example.org", 22, "SHA256:a").unwrap(),
            HostKeyStatus::Unknown
        );

        store
            .add(KnownHost::new("example.org", 22, "SHA256:a"))
            .unwrap();
        assert_eq!(
            store.check("EXAMPLE.org", 22, "SHA256:a").unwrap(),
            HostKeyStatus::Known
        );
        assert_eq!(
            store.check("example.org", 22, "SHA256:b").unwrap(),
            HostKeyStatus::Mismatch {
                expected: "SHA256:a".to_string()
            }
        );
        assert_eq!(
            store.check("example.org", 2222, "SHA256:a").unwrap(),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        store.add(KnownHost::new("a.example", 22, "SHA256:a")).unwrap();
        store.add(KnownHost::new("b.example", 2200, "SHA256:b")).unwrap();
        store.save().unwrap();

        let reloaded = create_test_store(&temp_dir);
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.check("b.example", 2200, "SHA256:b").unwrap(),
            HostKeyStatus::Known
        );
        assert!(!temp_dir.path().join("known_hosts.json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        assert!(store.load().is_ok());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known_hosts.json");
        fs::write(&path, "not json").unwrap();

        let store = KnownHostsStore::new(&path);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let store = KnownHostsStore::new(temp_dir.path().join("nested/dir/known_hosts.json"));
        store.add(KnownHost::new("host", 22, "SHA256:x")).unwrap();
        store.save().unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_remove_and_touch() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        store.add(KnownHost::new("host", 22, "SHA256:x")).unwrap();

        let before = store.list().unwrap()[0].last_seen;
        store.touch("host", 22).unwrap();
        let after = store.list().unwrap()[0].last_seen;
        assert!(after >= before);

        // Touching an unknown host is a no-op.
        store.touch("other", 22).unwrap();
        assert_eq!(store.len(), 1);

        let removed = store.remove("host", 22).unwrap();
        assert_eq!(removed.map(|h| h.fingerprint), Some("SHA256:x".to_string()));
        assert!(store.remove("host", 22).unwrap().is_none());
        assert!(store.is_empty());
    }
}
