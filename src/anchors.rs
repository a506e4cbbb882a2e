//! Anchor banks: versioned sets of calibrated statements, one per rating.
//!
//! File format (YAML):
//!
//! ```yaml
//! version: "1.0"
//! intent: purchase_intent
//! locale: en-US
//! anchor_sets:
//!   - id: set_a
//!     anchors:
//!       1: "I would definitely not buy this."
//!       5: "I would definitely buy this."
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("failed to read anchor file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse anchor file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("anchor file {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("anchor file {0} contains no anchor sets")]
    Empty(PathBuf),

    #[error("anchor file {path}: anchor set {set_id:?} rating keys differ from the first set")]
    InconsistentRatings { path: PathBuf, set_id: String },
}

/// Anchor statements for one independent "voter" on the scale.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    pub id: String,
    /// Rating -> statement, ordered by rating.
    pub anchors: BTreeMap<i32, String>,
}

impl AnchorSet {
    /// Statements in ascending rating order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.anchors.values().map(String::as_str)
    }
}

/// Immutable once loaded. Every set exposes the same rating keys.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorBank {
    pub version: String,
    pub intent: String,
    pub locale: String,
    pub anchor_sets: Vec<AnchorSet>,
}

impl AnchorBank {
    /// Sorted rating keys of the first anchor set.
    pub fn ratings(&self) -> Vec<i32> {
        self.anchor_sets
            .first()
            .map(|set| set.anchors.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn load(path: &Path) -> Result<Self, AnchorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AnchorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, path)
    }

    /// Parses and validates a bank; `origin` is only used in error messages.
    pub fn from_yaml_str(raw: &str, origin: &Path) -> Result<Self, AnchorError> {
        let file: RawAnchorFile = serde_yaml::from_str(raw).map_err(|source| AnchorError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let invalid = |message: String| AnchorError::Invalid {
            path: origin.to_path_buf(),
            message,
        };

        let version = scalar_to_string(&file.version)
            .ok_or_else(|| invalid("missing `version`".to_string()))?;
        let intent = scalar_to_string(&file.intent)
            .ok_or_else(|| invalid("missing `intent`".to_string()))?;
        let locale = scalar_to_string(&file.locale).unwrap_or_else(|| "en-US".to_string());

        let mut anchor_sets = Vec::with_capacity(file.anchor_sets.len());
        for (idx, entry) in file.anchor_sets.into_iter().enumerate() {
            let id = scalar_to_string(&entry.id).unwrap_or_else(|| format!("set_{idx}"));
            let mut anchors = BTreeMap::new();
            for (key, value) in entry.anchors {
                let rating = rating_key(&key).ok_or_else(|| {
                    invalid(format!("anchor set {id:?} has non-integer rating key {key:?}"))
                })?;
                let statement = scalar_to_string(&value).ok_or_else(|| {
                    invalid(format!("anchor set {id:?} rating {rating} has no statement"))
                })?;
                if anchors.insert(rating, statement).is_some() {
                    return Err(invalid(format!(
                        "anchor set {id:?} lists rating {rating} more than once"
                    )));
                }
            }
            if anchors.is_empty() {
                return Err(invalid(format!("anchor set {id:?} has no anchors")));
            }
            anchor_sets.push(AnchorSet { id, anchors });
        }

        let Some(first) = anchor_sets.first() else {
            return Err(AnchorError::Empty(origin.to_path_buf()));
        };
        let first_keys: Vec<i32> = first.anchors.keys().copied().collect();
        for set in &anchor_sets[1..] {
            if !set.anchors.keys().copied().eq(first_keys.iter().copied()) {
                return Err(AnchorError::InconsistentRatings {
                    path: origin.to_path_buf(),
                    set_id: set.id.clone(),
                });
            }
        }

        Ok(Self {
            version,
            intent,
            locale,
            anchor_sets,
        })
    }
}

#[derive(Deserialize)]
struct RawAnchorFile {
    #[serde(default)]
    version: serde_yaml::Value,
    #[serde(default)]
    intent: serde_yaml::Value,
    #[serde(default)]
    locale: serde_yaml::Value,
    #[serde(default)]
    anchor_sets: Vec<RawAnchorSet>,
}

#[derive(Deserialize)]
struct RawAnchorSet {
    #[serde(default)]
    id: serde_yaml::Value,
    #[serde(default)]
    anchors: serde_yaml::Mapping,
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn rating_key(value: &serde_yaml::Value) -> Option<i32> {
    match value {
        serde_yaml::Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Resolves an anchor file name against the anchor directory. Absolute paths
/// are used as given.
pub fn resolve_anchor_path(base_dir: &Path, filename: &str) -> PathBuf {
    let candidate = Path::new(filename);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// Banks loaded on first use and kept per resolved path until reloaded.
#[derive(Debug)]
pub struct AnchorBankCache {
    base_dir: PathBuf,
    banks: Mutex<HashMap<PathBuf, Arc<AnchorBank>>>,
}

impl AnchorBankCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            banks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn get(&self, filename: &str) -> Result<Arc<AnchorBank>, AnchorError> {
        let path = resolve_anchor_path(&self.base_dir, filename);
        if let Some(bank) = self.lock().get(&path) {
            return Ok(Arc::clone(bank));
        }
        // Loaded outside the lock; a racing loader only repeats the read.
        let bank = Arc::new(AnchorBank::load(&path)?);
        self.lock().insert(path, Arc::clone(&bank));
        Ok(bank)
    }

    /// Drops any cached copy and loads the file again.
    pub fn reload(&self, filename: &str) -> Result<Arc<AnchorBank>, AnchorError> {
        self.invalidate(filename);
        self.get(filename)
    }

    pub fn invalidate(&self, filename: &str) {
        let path = resolve_anchor_path(&self.base_dir, filename);
        self.lock().remove(&path);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<AnchorBank>>> {
        // A poisoned map still holds valid Arcs.
        self.banks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
