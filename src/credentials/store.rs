// Durable credential list file: load/save/disable/update_remark, all writes
// serialized through one lock. Generalized from a single-credential
// file-permission-checked load/save pair to an ordered list, plus the
// persist-under-lock pattern a multi-account credential broker needs.

use crate::error::{ProxyError, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Credential;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "swift", "quiet", "bold", "keen", "lucky", "mellow", "nimble", "proud",
    "rapid", "sharp", "sunny", "tidy", "vivid", "wise", "amber", "coral", "dusty", "eager",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "heron", "lynx", "marten", "osprey", "panther", "quokka", "raven", "stoat",
    "tapir", "urchin", "viper", "walrus", "yak", "zebra", "badger", "civet", "dingo", "egret",
];

fn generate_project_id() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let suffix: String = (0..5)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{adj}-{noun}-{suffix}")
}

/// Durable list of credentials in a single JSON file. Reads may bypass the
/// write lock; every write (save_all/disable/update_remark) is serialized
/// through it so concurrent writers observe strictly sequential durability.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), write_lock: Mutex::new(()) }
    }

    /// Read the file, parse the full (including disabled) list.
    /// Missing or unparsable file yields an empty list rather than an error
    /// — the scheduler then fails every request with "no credentials".
    async fn read_all(&self) -> Vec<Credential> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file missing or unreadable");
                return Vec::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(list) => list,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file unparsable");
                Vec::new()
            }
        }
    }

    async fn write_all(&self, credentials: &[Credential]) -> Result<()> {
        let json = serde_json::to_string_pretty(credentials)
            .map_err(|e| ProxyError::Internal(format!("failed to serialize credentials: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to write credentials: {e}")))
    }

    /// Read the full (enabled + disabled) list in file order, assigning and
    /// persisting any missing `project_id` along the way. Shared by `load()`
    /// (which filters to the enabled subset) and `load_full()` (which keeps
    /// every record, for callers that need disabled credentials too).
    async fn load_with_project_ids(&self) -> Result<Vec<Credential>> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await;

        let mut assigned_any = false;
        for cred in all.iter_mut() {
            if cred.project_id.is_empty() {
                cred.project_id = generate_project_id();
                assigned_any = true;
                debug!(project_id = %cred.project_id, "assigned project_id to credential missing one");
            }
        }
        if assigned_any {
            self.write_all(&all).await?;
        }

        Ok(all)
    }

    /// Load the full list, assign any missing `project_id`, persist those
    /// assignments, and return the enabled subset with a fresh in-memory
    /// `session_id` per credential.
    pub async fn load(&self) -> Result<Vec<Credential>> {
        let all = self.load_with_project_ids().await?;

        let mut rng = rand::thread_rng();
        let enabled: Vec<Credential> = all
            .into_iter()
            .filter(|c| c.enable)
            .map(|mut c| {
                // Signed-negative, magnitude bounded at 9e18.
                let magnitude = rng.gen_range(1..=9_000_000_000_000_000_000i64);
                c.session_id = -magnitude;
                c
            })
            .collect();

        info!(count = enabled.len(), "loaded enabled credentials");
        Ok(enabled)
    }

    /// Load the full list (including disabled credentials), in file order,
    /// with no `enable` filtering. Used by the scheduler to keep disabled
    /// credentials around for stats reporting after they drop out of
    /// rotation.
    pub async fn load_full(&self) -> Result<Vec<Credential>> {
        self.load_with_project_ids().await
    }

    /// Overlay updated records onto the on-disk list by `refresh_token`
    /// match. Records not present in `credentials` are left untouched.
    pub async fn save_all(&self, credentials: &[Credential]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await;

        for updated in credentials {
            if let Some(existing) =
                all.iter_mut().find(|c| c.refresh_token == updated.refresh_token)
            {
                *existing = updated.clone();
            } else {
                all.push(updated.clone());
            }
        }

        self.write_all(&all).await
    }

    /// Set `enable=false` on the credential matching `refresh_token`,
    /// persist, and return the freshly reloaded enabled set.
    pub async fn disable(&self, refresh_token: &str) -> Result<Vec<Credential>> {
        {
            let _guard = self.write_lock.lock().await;
            let mut all = self.read_all().await;
            let mut found = false;
            for cred in all.iter_mut() {
                if cred.refresh_token == refresh_token {
                    cred.enable = false;
                    found = true;
                }
            }
            if found {
                self.write_all(&all).await?;
                warn!(token_prefix = %refresh_token.chars().take(10).collect::<String>(), "credential disabled");
            }
        }
        self.load().await
    }

    /// Update `remark` by index in the full (including disabled) list.
    pub async fn update_remark(&self, index: usize, remark: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await;
        let entry = all
            .get_mut(index)
            .ok_or_else(|| ProxyError::Validation(format!("no credential at index {index}")))?;
        entry.remark = remark.to_string();
        self.write_all(&all).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn write_fixture(json: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), json).unwrap();
        file
    }

    #[tokio::test]
    async fn load_assigns_missing_project_id_and_persists_it() {
        let file = write_fixture(
            r#"[{"refresh_token":"1//0abc","access_token":"ya29.x","expires_in":3600,"timestamp":0,"enable":true}]"#,
        );
        let store = CredentialStore::new(file.path());
        let enabled = store.load().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert!(!enabled[0].project_id.is_empty());

        // Reload from the now-persisted file and confirm the id is stable.
        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded[0].project_id, enabled[0].project_id);
    }

    #[tokio::test]
    async fn disabled_credential_is_excluded_from_enabled_set() {
        let file = write_fixture(
            r#"[{"refresh_token":"1//0abc","enable":false,"project_id":"p"},
                {"refresh_token":"1//0def","enable":true,"project_id":"q"}]"#,
        );
        let store = CredentialStore::new(file.path());
        let enabled = store.load().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].refresh_token, "1//0def");
    }

    #[tokio::test]
    async fn disable_persists_enable_false_and_reloads() {
        let file = write_fixture(
            r#"[{"refresh_token":"1//0abc","enable":true,"project_id":"p"}]"#,
        );
        let store = CredentialStore::new(file.path());
        let remaining = store.disable("1//0abc").await.unwrap();
        assert!(remaining.is_empty());

        let raw = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert!(raw.contains("\"enable\": false"));
    }

    #[tokio::test]
    async fn session_id_never_reaches_disk() {
        let file = write_fixture(
            r#"[{"refresh_token":"1//0abc","enable":true,"project_id":"p"}]"#,
        );
        let store = CredentialStore::new(file.path());
        let enabled = store.load().await.unwrap();
        store.save_all(&enabled).await.unwrap();
        let raw = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert!(!raw.contains("session_id"));
    }

    #[tokio::test]
    async fn missing_file_yields_empty_enabled_set() {
        let store = CredentialStore::new("/nonexistent/dir/accounts.json");
        let enabled = store.load().await.unwrap();
        assert!(enabled.is_empty());
    }

    #[tokio::test]
    async fn update_remark_targets_index_in_full_list() {
        let file = write_fixture(
            r#"[{"refresh_token":"1//0abc","enable":false,"project_id":"p"},
                {"refresh_token":"1//0def","enable":true,"project_id":"q"}]"#,
        );
        let store = CredentialStore::new(file.path());
        store.update_remark(0, "retired").await.unwrap();
        let raw = tokio::fs::read_to_string(file.path()).await.unwrap();
        let all: Vec<Credential> = serde_json::from_str(&raw).unwrap();
        assert_eq!(all[0].remark, "retired");
        assert_eq!(all[1].remark, "");
    }
}
