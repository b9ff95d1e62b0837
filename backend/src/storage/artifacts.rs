//! Deployment artifact storage
//!
//! Layout: `<root>/<target>/<name>/<version>/<deployment-id>/` holding
//! `agent.py`, `config.json`, `deployment.log` and `result.json`.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentOutputs, TargetType};

pub const CODE_FILE: &str = "agent.py";
pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "deployment.log";
pub const RESULT_FILE: &str = "result.json";

/// Category-keyed file storage rooted in one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Dir,
}

fn checked_key(key_path: &str) -> Result<&Path, BackendError> {
    let path = Path::new(key_path);
    let clean = !key_path.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(path)
    } else {
        Err(BackendError::StorageError(format!(
            "invalid artifact key: {:?}",
            key_path
        )))
    }
}

impl ArtifactStore {
    pub fn new(root: Dir) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    fn path_for(&self, category: &str, key_path: &str) -> Result<PathBuf, BackendError> {
        let category = checked_key(category)?;
        let key = checked_key(key_path)?;
        Ok(self.root.path().join(category).join(key))
    }

    pub async fn save(
        &self,
        category: &str,
        key_path: &str,
        content: &str,
    ) -> Result<PathBuf, BackendError> {
        let path = self.path_for(category, key_path)?;
        File::new(&path).write_string(content).await?;
        Ok(path)
    }

    pub async fn load(&self, category: &str, key_path: &str) -> Result<String, BackendError> {
        let file = File::new(self.path_for(category, key_path)?);
        if !file.exists().await {
            return Err(BackendError::NotFound(format!(
                "artifact {}/{}",
                category, key_path
            )));
        }
        file.read_string().await
    }

    /// Artifact set for one deployment
    pub fn deployment_set(
        &self,
        target: TargetType,
        name: &str,
        version: &str,
        deployment_id: &str,
    ) -> Result<ArtifactSet, BackendError> {
        let key = format!("{}/{}/{}", name, version, deployment_id);
        checked_key(&key)?;
        Ok(ArtifactSet {
            store: self.clone(),
            category: target.as_str().to_string(),
            prefix: key,
        })
    }
}

/// Final record written to `result.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub target: TargetType,
    pub success: bool,
    pub message: String,
    pub streaming_capable: bool,
    pub outputs: DeploymentOutputs,
    pub completed_at: DateTime<Utc>,
    pub deployment_time: Option<f64>,
}

/// The files of one deployment
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    store: ArtifactStore,
    category: String,
    prefix: String,
}

impl ArtifactSet {
    fn key(&self, file: &str) -> String {
        format!("{}/{}", self.prefix, file)
    }

    pub fn dir(&self) -> Dir {
        Dir::new(self.store.root.path().join(&self.category).join(&self.prefix))
    }

    pub async fn save_code(&self, code: &str) -> Result<PathBuf, BackendError> {
        self.store.save(&self.category, &self.key(CODE_FILE), code).await
    }

    /// Persist configuration; secrets serialize as redacted values
    pub async fn save_config<T: Serialize>(&self, config: &T) -> Result<PathBuf, BackendError> {
        let json = serde_json::to_string_pretty(config)?;
        self.store.save(&self.category, &self.key(CONFIG_FILE), &json).await
    }

    /// Persist an extra bundle file next to the code
    pub async fn save_file(&self, file: &str, content: &str) -> Result<PathBuf, BackendError> {
        self.store.save(&self.category, &self.key(file), content).await
    }

    pub async fn append_log(&self, line: &str) -> Result<(), BackendError> {
        let path = self.store.path_for(&self.category, &self.key(LOG_FILE))?;
        File::new(path).append_line(line).await
    }

    pub async fn save_result(&self, result: &DeploymentResult) -> Result<PathBuf, BackendError> {
        let json = serde_json::to_string_pretty(result)?;
        self.store.save(&self.category, &self.key(RESULT_FILE), &json).await
    }

    pub async fn load_result(&self) -> Result<DeploymentResult, BackendError> {
        let json = self.store.load(&self.category, &self.key(RESULT_FILE)).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Dir::new(dir.path()));
        let set = store
            .deployment_set(TargetType::Lambda, "hello-fn", "v1", "abc")
            .unwrap();

        let path = set.save_code("print('hi')").await.unwrap();
        assert!(path.ends_with("lambda/hello-fn/v1/abc/agent.py"));
        set.append_log("building").await.unwrap();
        set.append_log("done").await.unwrap();

        let log = store.load("lambda", "hello-fn/v1/abc/deployment.log").await.unwrap();
        assert_eq!(log, "building\ndone\n");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Dir::new(dir.path()));
        assert!(store.save("lambda", "../escape.txt", "x").await.is_err());
        assert!(store.save("lambda", "/etc/passwd", "x").await.is_err());
        assert!(store
            .deployment_set(TargetType::Ecs, "..", "v1", "id")
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(Dir::new(dir.path()));
        assert!(matches!(
            store.load("ecs", "svc/v1/x/result.json").await,
            Err(BackendError::NotFound(_))
        ));
    }
}
