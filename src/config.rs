use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BridgeError;

fn default_sensitivity() -> f64 {
    0.00015
}

fn default_deadzone() -> i32 {
    2
}

fn default_gamma() -> f64 {
    1.0
}

fn default_spin_axis() -> SpinAxis {
    SpinAxis::Z
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpinAxis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    Key,
    Modifier,
    Logic,
    OpenBrowser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonBinding {
    pub action: ButtonAction,
    pub value: String,
}

/// Tolerates the legacy shape `{"translation": n}` alongside a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
enum SensitivityShape {
    Scalar(f64),
    Legacy { translation: f64 },
}

impl From<SensitivityShape> for f64 {
    fn from(shape: SensitivityShape) -> Self {
        match shape {
            SensitivityShape::Scalar(v) => v,
            SensitivityShape::Legacy { translation } => translation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sensitivity", deserialize_with = "deserialize_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_deadzone")]
    pub deadzone: i32,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_spin_axis")]
    pub spin_axis: SpinAxis,
    #[serde(default)]
    pub buttons: HashMap<String, ButtonBinding>,
}

fn deserialize_sensitivity<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    SensitivityShape::deserialize(deserializer).map(f64::from)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            deadzone: default_deadzone(),
            gamma: default_gamma(),
            spin_axis: default_spin_axis(),
            buttons: HashMap::new(),
        }
    }
}

impl Config {
    pub fn trans_scale(&self) -> f64 {
        self.sensitivity * 0.5 / 350.0
    }

    pub fn rot_scale(&self) -> f64 {
        self.sensitivity * 10.0 / 350.0
    }
}

/// `$XDG_CONFIG_HOME/spacemouse-bridge` (or the platform equivalent),
/// also where TLS cert/key material lives per spec §6.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("spacemouse-bridge"))
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.json"))
}

/// Read-mostly snapshot behind an async `RwLock`, per Design Notes: motion
/// pipeline passes clone a cheap `Arc<Config>` rather than holding the lock.
#[derive(Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub async fn load(path: Option<PathBuf>) -> Self {
        let path = path.or_else(config_path);
        let loaded = match &path {
            Some(p) => load_from_disk(p).await.unwrap_or_default(),
            None => Config::default(),
        };
        Self {
            path,
            inner: Arc::new(RwLock::new(Arc::new(loaded))),
        }
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&*self.inner.read().await)
    }

    /// Persists `new_config` to disk (temp file + rename) and swaps the
    /// in-memory snapshot regardless of persist outcome, matching
    /// §7 ConfigPersistError: the caller learns of the failure, but motion
    /// processing always sees the freshest value.
    pub async fn set(&self, new_config: Config) -> Result<(), BridgeError> {
        let new_config = Arc::new(new_config);
        let persist_result = match &self.path {
            Some(path) => persist_to_disk(path, &new_config).await,
            None => Ok(()),
        };
        *self.inner.write().await = new_config;
        persist_result
    }
}

async fn load_from_disk(path: &Path) -> Option<Config> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn persist_to_disk(path: &Path, config: &Config) -> Result<(), BridgeError> {
    let path = path.to_path_buf();
    let body = serde_json::to_vec_pretty(config).map_err(|err| {
        BridgeError::ConfigPersist(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })?;
    tokio::task::spawn_blocking(move || -> Result<(), BridgeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(BridgeError::ConfigPersist)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &body).map_err(BridgeError::ConfigPersist)?;
        std::fs::rename(&tmp_path, &path).map_err(BridgeError::ConfigPersist)?;
        Ok(())
    })
    .await
    .map_err(|err| BridgeError::ConfigPersist(std::io::Error::other(err)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sensitivity_parses() {
        let cfg: Config = serde_json::from_str(r#"{"sensitivity": 0.0002}"#).unwrap();
        assert!((cfg.sensitivity - 0.0002).abs() < f64::EPSILON);
    }

    #[test]
    fn legacy_sensitivity_shape_parses() {
        let cfg: Config =
            serde_json::from_str(r#"{"sensitivity": {"translation": 0.0002}}"#).unwrap();
        assert!((cfg.sensitivity - 0.0002).abs() < f64::EPSILON);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempdir();
        let path = dir.join("config.json");
        let handle = ConfigHandle::load(Some(path.clone())).await;
        let mut next = Config::default();
        next.sensitivity = 2.0;
        next.deadzone = 5;
        handle.set(next.clone()).await.unwrap();

        let reloaded = ConfigHandle::load(Some(path)).await;
        assert_eq!(*reloaded.snapshot().await, next);
        std::fs::remove_dir_all(dir_parent()).ok();
    }

    fn dir_parent() -> PathBuf {
        std::env::temp_dir().join("spacemouse-bridge-test")
    }

    fn tempdir() -> PathBuf {
        let dir = dir_parent();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
