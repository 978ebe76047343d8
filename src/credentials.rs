//! Flat-file credential store.
//!
//! One `login---password` record per line, append-only. Lookups are a linear
//! scan of the whole file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CredentialError;
use crate::protocol::is_line_break;

const SEPARATOR: &str = "---";

/// Backing store for account credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Register a new login, or check an existing one.
    ///
    /// With `register` set, returns `false` when the login is already taken
    /// or is empty; otherwise appends the record and returns `true`. Without
    /// it, returns whether the login exists with exactly this password.
    async fn check_or_register(
        &self,
        login: &str,
        password: &str,
        register: bool,
    ) -> Result<bool, CredentialError>;
}

/// Whether a login/password pair can be stored as one record line.
pub fn is_storable(login: &str, password: &str) -> bool {
    !login.is_empty()
        && !login.contains(SEPARATOR)
        && !login.chars().any(is_line_break)
        && !password.chars().any(is_line_break)
}

pub struct FileCredentialStore {
    path: PathBuf,
    /// Serializes scan-then-append across connections.
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored password for `login`, if any.
    async fn find(&self, login: &str) -> Result<Option<String>, CredentialError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Read {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };

        Ok(contents
            .lines()
            .filter_map(|record| record.split_once(SEPARATOR))
            .find(|(stored_login, _)| *stored_login == login)
            .map(|(_, stored_password)| stored_password.to_string()))
    }

    async fn append(&self, login: &str, password: &str) -> Result<(), CredentialError> {
        let append_err = |source| CredentialError::Append {
            path: self.path.display().to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(append_err)?;

        let record = format!("{login}{SEPARATOR}{password}\n");
        file.write_all(record.as_bytes()).await.map_err(append_err)?;
        file.flush().await.map_err(append_err)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn check_or_register(
        &self,
        login: &str,
        password: &str,
        register: bool,
    ) -> Result<bool, CredentialError> {
        let _guard = self.lock.lock().await;
        let stored = self.find(login).await?;

        if !register {
            return Ok(stored.is_some_and(|stored| stored == password));
        }

        if stored.is_some() || !is_storable(login, password) {
            debug!(login = %login, "Registration rejected");
            return Ok(false);
        }

        self.append(login, password).await?;
        info!(login = %login, "Registered new login");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn register_then_sign_in() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users.txt"));

        assert!(store.check_or_register("alice", "pw1", true).await.unwrap());
        assert!(store.check_or_register("alice", "pw1", false).await.unwrap());
        assert!(!store.check_or_register("alice", "pw2", false).await.unwrap());
        assert!(!store.check_or_register("alice", "pw", false).await.unwrap());
        assert!(!store.check_or_register("bob", "pw1", false).await.unwrap());

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents, "alice---pw1\n");
    }

    #[tokio::test]
    async fn duplicate_registration_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users.txt"));

        assert!(store.check_or_register("alice", "pw1", true).await.unwrap());
        assert!(!store.check_or_register("alice", "other", true).await.unwrap());

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(store.check_or_register("alice", "pw1", false).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_unstorable_logins() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users.txt"));

        assert!(!store.check_or_register("", "pw", true).await.unwrap());
        assert!(!store.check_or_register("a---b", "pw", true).await.unwrap());
        assert!(!store.check_or_register("a\nb", "pw", true).await.unwrap());
        assert!(!store.check_or_register("carol", "p\nw", true).await.unwrap());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn password_may_contain_separator() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users.txt"));

        assert!(store.check_or_register("dave", "a---b", true).await.unwrap());
        assert!(store.check_or_register("dave", "a---b", false).await.unwrap());
        assert!(!store.check_or_register("dave", "a", false).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_registrations_of_one_login_succeed_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(dir.path().join("users.txt")));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_or_register("eve", &format!("pw{i}"), true)
                    .await
                    .unwrap()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn missing_file_means_no_logins() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("absent.txt"));
        assert!(!store.check_or_register("alice", "pw1", false).await.unwrap());
    }
}
