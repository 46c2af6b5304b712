use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::Instance;

#[derive(Debug, Default, Deserialize)]
struct InstancesFile {
    #[serde(default)]
    instances: HashMap<String, Instance>,
}

#[derive(Serialize)]
struct InstancesFileRef<'a> {
    instances: &'a HashMap<String, Instance>,
}

/// On-disk instance catalogue: one YAML file, written atomically via
/// temp-and-rename. A crash mid-write never corrupts the previous file.
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<HashMap<String, Instance>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read instances file {}", self.path.display()))?;
        let file: InstancesFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse instances yaml {}", self.path.display()))?;

        for (name, instance) in &file.instances {
            if name.trim().is_empty() {
                anyhow::bail!("instance name cannot be empty");
            }
            if instance.template.trim().is_empty() {
                anyhow::bail!("instance {name:?} missing template");
            }
        }
        Ok(file.instances)
    }

    pub async fn save(&self, instances: &HashMap<String, Instance>) -> anyhow::Result<()> {
        let data = serde_yaml::to_string(&InstancesFileRef { instances })
            .context("serialize instances")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }

        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(data.as_bytes())
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        file.flush().await.ok();

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HashMap<String, Instance> {
        let mut instances = HashMap::new();
        instances.insert(
            "web".to_string(),
            Instance {
                template: "sleeper".to_string(),
                enabled: true,
                params: HashMap::from([("seconds".to_string(), "60".to_string())]),
            },
        );
        instances
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("instances.yaml"));

        let instances = sample();
        store.save(&instances).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, instances);
    }

    #[tokio::test]
    async fn save_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("configs").join("instances.yaml"));
        store.save(&sample()).await.unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn stale_tmp_file_never_corrupts_a_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("instances.yaml"));

        let instances = sample();
        store.save(&instances).await.unwrap();

        // Simulate a crash mid-write: a truncated temp file left behind.
        std::fs::write(dir.path().join("instances.yaml.tmp"), "instances:\n  br").unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, instances);
    }

    #[tokio::test]
    async fn load_rejects_an_empty_template_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.yaml");
        std::fs::write(&path, "instances:\n  web:\n    template: \"\"\n").unwrap();
        assert!(Store::new(path).load().await.is_err());
    }
}
