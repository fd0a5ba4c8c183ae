//! Persistent store of remembered argument values.
//!
//! The store is a YAML document with one mapping of remembered values per
//! sub-command and the list of shells that have been initialized. It is read
//! once at startup, mutated during argument resolution and written back
//! wholesale.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

const DEFAULTS_KEY: &str = "defaults";
const SHELLS_KEY: &str = "initialized_shells";

/// A remembered argument value. Only strings and integers are ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    defaults: BTreeMap<String, BTreeMap<String, Scalar>>,
    #[serde(default)]
    initialized_shells: BTreeSet<String>,
    /// Keys written by other versions of the tool, carried through saves.
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Shape every store must have. Missing top-level keys are filled from here.
fn template() -> Mapping {
    let mut doc = Mapping::new();
    doc.insert(DEFAULTS_KEY.into(), Value::Mapping(Mapping::new()));
    doc.insert(SHELLS_KEY.into(), Value::Sequence(Vec::new()));
    doc
}

/// Add template keys absent from `doc`. Returns true if anything was added.
pub fn ensure_keys(doc: &mut Mapping) -> bool {
    let mut added = false;
    for (key, value) in template() {
        if !doc.contains_key(&key) {
            doc.insert(key, value);
            added = true;
        }
    }
    added
}

#[derive(Debug)]
pub struct DefaultsStore {
    path: PathBuf,
    data: StoreData,
}

impl DefaultsStore {
    /// Load the store, creating and persisting an empty one on first run.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "creating defaults store");
                let store = Self {
                    path,
                    data: StoreData::default(),
                };
                store.save()?;
                return Ok(store);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read defaults from {}", path.display()))
            }
        };

        let mut doc: Mapping = if text.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Malformed defaults file {}", path.display()))?
        };
        let added = ensure_keys(&mut doc);
        let data: StoreData = serde_yaml::from_value(Value::Mapping(doc))
            .with_context(|| format!("Malformed defaults file {}", path.display()))?;

        let store = Self { path, data };
        if added {
            debug!("defaults store schema extended, saving");
            store.save()?;
        }
        Ok(store)
    }

    /// Overwrite the file with the in-memory state.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_yaml::to_string(&self.data).context("Failed to serialize defaults")?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn get_default(&self, command: &str, arg: &str) -> Option<&Scalar> {
        self.data.defaults.get(command)?.get(arg)
    }

    pub fn set_default(&mut self, command: &str, arg: &str, value: impl Into<Scalar>) {
        self.data
            .defaults
            .entry(command.to_string())
            .or_default()
            .insert(arg.to_string(), value.into());
    }

    /// All remembered values for one sub-command.
    #[cfg(test)]
    pub fn command_defaults(&self, command: &str) -> Option<&BTreeMap<String, Scalar>> {
        self.data.defaults.get(command)
    }

    /// Forget one argument. Returns whether it was stored.
    pub fn reset_arg(&mut self, command: &str, arg: &str) -> bool {
        let Some(args) = self.data.defaults.get_mut(command) else {
            return false;
        };
        let removed = args.remove(arg).is_some();
        if args.is_empty() {
            self.data.defaults.remove(command);
        }
        removed
    }

    /// Forget every argument of one sub-command.
    pub fn reset_command(&mut self, command: &str) -> bool {
        self.data.defaults.remove(command).is_some()
    }

    pub fn reset_all(&mut self) {
        self.data.defaults.clear();
    }

    /// Record that a shell hook was installed. Returns false if already known.
    pub fn register_shell(&mut self, shell: &str) -> bool {
        self.data.initialized_shells.insert(shell.to_string())
    }

    #[cfg(test)]
    pub fn initialized_shells(&self) -> impl Iterator<Item = &str> {
        self.data.initialized_shells.iter().map(String::as_str)
    }

    /// Render the remembered values as YAML.
    pub fn defaults_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.data.defaults).context("Failed to serialize defaults")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> DefaultsStore {
        DefaultsStore::load(dir.path().join("config.yaml")).unwrap()
    }

    #[test]
    fn test_first_load_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let store = DefaultsStore::load(&path).unwrap();
        assert!(path.exists());
        assert!(store.command_defaults("launch").is_none());
        assert_eq!(store.initialized_shells().count(), 0);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("defaults"));
        assert!(text.contains("initialized_shells"));
    }

    #[test]
    fn test_round_trip_across_loads() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.set_default("launch", "workspace", "ai2/dev");
        store.set_default("launch", "gpus", 4);
        assert_eq!(
            store.get_default("launch", "workspace"),
            Some(&Scalar::Str("ai2/dev".into()))
        );
        store.save().unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(
            reloaded.get_default("launch", "workspace"),
            Some(&Scalar::Str("ai2/dev".into()))
        );
        assert_eq!(reloaded.get_default("launch", "gpus"), Some(&Scalar::Int(4)));
    }

    #[test]
    fn test_numeric_looking_string_stays_string() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.set_default("launch", "budget", "123");
        store.save().unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(
            reloaded.get_default("launch", "budget"),
            Some(&Scalar::Str("123".into()))
        );
    }

    #[test]
    fn test_reset_scopes() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.set_default("launch", "workspace", "ws");
        store.set_default("launch", "budget", "b");
        store.set_default("monitor", "interval", 5);

        assert!(store.reset_arg("launch", "workspace"));
        assert!(store.get_default("launch", "workspace").is_none());
        assert!(store.get_default("launch", "budget").is_some());
        assert!(!store.reset_arg("launch", "workspace"));

        assert!(store.reset_command("launch"));
        assert!(store.command_defaults("launch").is_none());
        assert_eq!(store.get_default("monitor", "interval"), Some(&Scalar::Int(5)));

        store.reset_all();
        assert!(store.get_default("monitor", "interval").is_none());
    }

    #[test]
    fn test_missing_keys_are_added_and_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "defaults:\n  list: {}\n").unwrap();

        let store = DefaultsStore::load(&path).unwrap();
        assert_eq!(store.initialized_shells().count(), 0);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("initialized_shells"));
    }

    #[test]
    fn test_unknown_keys_survive_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "defaults: {}\ninitialized_shells: []\nfuture: 1\n").unwrap();

        let store = DefaultsStore::load(&path).unwrap();
        store.save().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("future: 1"));
    }

    #[test]
    fn test_ensure_keys() {
        let mut doc = template();
        assert!(!ensure_keys(&mut doc));
        let mut empty = Mapping::new();
        assert!(ensure_keys(&mut empty));
        assert_eq!(empty.len(), 2);
    }

    #[test]
    fn test_register_shell_dedupes() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        assert!(store.register_shell("bash"));
        assert!(!store.register_shell("bash"));
        assert_eq!(store.initialized_shells().collect::<Vec<_>>(), vec!["bash"]);
    }
}
