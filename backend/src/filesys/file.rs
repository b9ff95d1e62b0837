//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::BackendError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn read_string(&self) -> Result<String, BackendError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, BackendError> {
        let contents = self.read_string().await?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub async fn read_yaml<T: DeserializeOwned>(&self) -> Result<T, BackendError> {
        let contents = self.read_string().await?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Write string to file, creating parent directories
    pub async fn write_string(&self, contents: &str) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), BackendError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_string(&contents).await
    }

    pub async fn write_yaml<T: Serialize>(&self, value: &T) -> Result<(), BackendError> {
        let contents = serde_yaml::to_string(value)?;
        self.write_string(&contents).await
    }

    /// Append a line, creating the file if needed
    pub async fn append_line(&self, line: &str) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), BackendError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Restrict to owner read/write (0o600). No-op off Unix.
    pub async fn set_permissions_600(&self) -> Result<(), BackendError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path).await?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }

    /// Write through a sibling temp file and rename into place
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let log = File::new(dir.path().join("nested").join("deployment.log"));
        log.append_line("first").await.unwrap();
        log.append_line("second").await.unwrap();
        assert_eq!(log.read_string().await.unwrap(), "first\nsecond\n");

        let result = File::new(dir.path().join("result.json"));
        result.write_atomic(b"{\"ok\":true}").await.unwrap();
        let value: serde_json::Value = result.read_json().await.unwrap();
        assert_eq!(value["ok"], true);
        assert!(!File::new(dir.path().join("result.tmp")).exists().await);
    }
}
