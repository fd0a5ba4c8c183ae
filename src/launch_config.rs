//! Named launch presets read from `launch.conf`.

use crate::error::{join_or_none, BeakerUtilError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Reserved preset merged underneath every named one.
pub const DEFAULT_PRESET: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub src: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub dst: String,
}

/// One preset. Every field is optional so presets can be layered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPreset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_secrets: BTreeMap<String, String>,
}

impl LaunchPreset {
    /// Layer `self` on top of `base`. Keys set in `self` replace the base
    /// value wholesale, collections included.
    pub fn over(self, base: &LaunchPreset) -> LaunchPreset {
        LaunchPreset {
            cluster: self.cluster.or_else(|| base.cluster.clone()),
            workspace: self.workspace.or_else(|| base.workspace.clone()),
            budget: self.budget.or_else(|| base.budget.clone()),
            gpus: self.gpus.or(base.gpus),
            image: self.image.or_else(|| base.image.clone()),
            name: self.name.or_else(|| base.name.clone()),
            node: self.node.or_else(|| base.node.clone()),
            mounts: if self.mounts.is_empty() {
                base.mounts.clone()
            } else {
                self.mounts
            },
            env_secrets: if self.env_secrets.is_empty() {
                base.env_secrets.clone()
            } else {
                self.env_secrets
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfigs {
    path: PathBuf,
    presets: BTreeMap<String, LaunchPreset>,
}

impl LaunchConfigs {
    /// Read the presets file. Returns `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Some(Self::parse(path, &text)?))
    }

    /// Like `load`, but a missing file is an error.
    pub fn load_required(path: &Path) -> Result<Self> {
        Self::load(path)?.ok_or_else(|| {
            BeakerUtilError::LaunchConfigMissing(path.display().to_string()).into()
        })
    }

    fn parse(path: &Path, text: &str) -> Result<Self> {
        let presets = if text.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(text)
                .with_context(|| format!("Malformed launch configuration {}", path.display()))?
        };
        Ok(Self {
            path: path.to_path_buf(),
            presets,
        })
    }

    /// Selectable preset names, sorted, without the reserved default.
    pub fn names(&self) -> Vec<String> {
        self.presets
            .keys()
            .filter(|name| name.as_str() != DEFAULT_PRESET)
            .cloned()
            .collect()
    }

    fn base(&self) -> LaunchPreset {
        self.presets.get(DEFAULT_PRESET).cloned().unwrap_or_default()
    }

    /// The named preset with the default preset merged underneath.
    pub fn resolve(&self, name: &str) -> Result<LaunchPreset, BeakerUtilError> {
        match self.presets.get(name) {
            Some(preset) if name != DEFAULT_PRESET => Ok(preset.clone().over(&self.base())),
            _ => Err(BeakerUtilError::NoSuchLaunchConfig {
                name: name.to_string(),
                path: self.path.display().to_string(),
                available: join_or_none(&self.names()),
            }),
        }
    }

    /// The default preset alone, used when no preset name is given.
    pub fn default_preset(&self) -> LaunchPreset {
        self.base()
    }

    /// Render every named preset, fully merged, one YAML block each.
    pub fn render(&self) -> Result<String> {
        let mut blocks = Vec::new();
        for name in self.names() {
            let preset = self.resolve(&name)?;
            let mut single = BTreeMap::new();
            single.insert(name, preset);
            blocks.push(serde_yaml::to_string(&single).context("Failed to render preset")?);
        }
        Ok(blocks.join("\n"))
    }
}
