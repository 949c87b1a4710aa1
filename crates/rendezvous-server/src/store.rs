//! JSON persistence for the account table.
//!
//! The whole table is rewritten on every save. Writes go to a sibling
//! temporary file which is then renamed over the target, so a crash mid-save
//! leaves the previous table intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::account::Account;
use crate::error::ServerError;

pub type AccountTable = BTreeMap<String, Account>;

#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table. A missing file is an empty table; an unreadable one is
    /// an error so that a later save does not overwrite it.
    pub async fn load(&self) -> Result<AccountTable, ServerError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No account file, starting empty");
                return Ok(AccountTable::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut table: AccountTable = serde_json::from_slice(&data).map_err(|e| {
            ServerError::Storage(format!(
                "Failed to parse account file '{}': {}",
                self.path.display(),
                e
            ))
        })?;

        for (username, account) in table.iter_mut() {
            account.online = false;
            if account.username != *username {
                account.username = username.clone();
            }
        }

        info!(
            path = %self.path.display(),
            accounts = table.len(),
            "Account table loaded"
        );
        Ok(table)
    }

    pub async fn save(&self, table: &AccountTable) -> Result<(), ServerError> {
        let data = serde_json::to_vec_pretty(table)
            .map_err(|e| ServerError::Storage(format!("Failed to encode accounts: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), accounts = table.len(), "Account table saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "accounts".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("users.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_resets_online() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("nested").join("users.json"));

        let mut alice = Account::new("alice", "pw");
        alice.online = true;
        alice.friends.insert("bob".to_string());
        let mut bob = Account::new("bob", "pw2");
        bob.friends.insert("alice".to_string());

        let mut table = AccountTable::new();
        table.insert("alice".to_string(), alice);
        table.insert("bob".to_string(), bob);
        store.save(&table).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded["alice"].online);
        assert!(loaded["alice"].is_friend("bob"));
        assert!(loaded["bob"].is_friend("alice"));
        assert_eq!(loaded["bob"].secret, "pw2");
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = AccountStore::new(&path);
        assert!(matches!(store.load().await, Err(ServerError::Storage(_))));
    }
}
