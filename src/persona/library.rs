//! Persona groups stored as YAML files in a library directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use super::{PersonaError, PersonaSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub personas: Vec<PersonaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Deserialize)]
struct RawGroupFile {
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "persona_source")]
    source: Option<String>,
    #[serde(default)]
    personas: Vec<PersonaSpec>,
}

impl PersonaGroup {
    pub fn load(path: &Path) -> Result<Self, PersonaError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PersonaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "personas".to_string());
        Self::from_yaml_str(&raw, &stem, &path.display().to_string())
    }

    /// Parses a group definition. `default_name` is used when the file has no
    /// `group` key; `source_name` only appears in errors.
    pub fn from_yaml_str(
        raw: &str,
        default_name: &str,
        source_name: &str,
    ) -> Result<Self, PersonaError> {
        let file: RawGroupFile = serde_yaml::from_str(raw).map_err(|source| PersonaError::Yaml {
            source_name: source_name.to_string(),
            source,
        })?;

        let personas = file.personas;
        if personas.is_empty() {
            return Err(PersonaError::invalid(
                source_name,
                "persona file contains no personas",
            ));
        }

        Ok(Self {
            name: file
                .group
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| default_name.to_string()),
            description: file.description.unwrap_or_default(),
            personas,
            source: file.source,
        })
    }
}

/// All groups found in one directory. Reloadable in place.
#[derive(Debug)]
pub struct PersonaLibrary {
    directory: PathBuf,
    groups: RwLock<BTreeMap<String, Arc<PersonaGroup>>>,
}

impl PersonaLibrary {
    pub fn load(directory: impl Into<PathBuf>) -> Result<Self, PersonaError> {
        let directory = directory.into();
        let groups = load_groups(&directory)?;
        Ok(Self {
            directory,
            groups: RwLock::new(groups),
        })
    }

    /// A library with no backing files, for callers that compose from inline
    /// personas only.
    pub fn empty(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            groups: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn reload(&self) -> Result<(), PersonaError> {
        let fresh = load_groups(&self.directory)?;
        *self.groups.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    pub fn group_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn groups(&self) -> Vec<Arc<PersonaGroup>> {
        self.read().values().cloned().collect()
    }

    /// Looks a group up, reloading the directory once on a miss.
    pub fn get_group(&self, name: &str) -> Result<Arc<PersonaGroup>, PersonaError> {
        if let Some(group) = self.read().get(name) {
            return Ok(Arc::clone(group));
        }
        tracing::debug!(group = name, directory = %self.directory.display(), "group miss, reloading library");
        self.reload()?;
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| PersonaError::NotFound {
                name: name.to_string(),
                directory: self.directory.clone(),
            })
    }

    /// Owned copies of the personas in `group`, or of every group when `None`.
    pub fn list_personas(&self, group: Option<&str>) -> Result<Vec<PersonaSpec>, PersonaError> {
        match group {
            Some(name) => Ok(self.get_group(name)?.personas.clone()),
            None => Ok(self
                .read()
                .values()
                .flat_map(|g| g.personas.iter().cloned())
                .collect()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<PersonaGroup>>> {
        self.groups.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_groups(directory: &Path) -> Result<BTreeMap<String, Arc<PersonaGroup>>, PersonaError> {
    let mut groups = BTreeMap::new();
    if !directory.exists() {
        tracing::warn!(directory = %directory.display(), "persona library directory does not exist");
        return Ok(groups);
    }

    let entries = std::fs::read_dir(directory).map_err(|source| PersonaError::Io {
        path: directory.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
        })
        .collect();
    files.sort();

    for path in files {
        let group = PersonaGroup::load(&path)?;
        if groups.contains_key(&group.name) {
            return Err(PersonaError::DuplicateGroup {
                name: group.name,
                path,
            });
        }
        groups.insert(group.name.clone(), Arc::new(group));
    }

    tracing::debug!(directory = %directory.display(), groups = groups.len(), "loaded persona library");
    Ok(groups)
}

/// Libraries per directory, loaded on first use.
#[derive(Debug, Default)]
pub struct PersonaLibraryCache {
    libraries: Mutex<HashMap<PathBuf, Arc<PersonaLibrary>>>,
}

impl PersonaLibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, directory: &Path) -> Result<Arc<PersonaLibrary>, PersonaError> {
        if let Some(lib) = self.lock().get(directory) {
            return Ok(Arc::clone(lib));
        }
        let lib = Arc::new(PersonaLibrary::load(directory)?);
        self.lock()
            .insert(directory.to_path_buf(), Arc::clone(&lib));
        Ok(lib)
    }

    /// Replaces the cached library for `directory` with a fresh load.
    pub fn reload(&self, directory: &Path) -> Result<Arc<PersonaLibrary>, PersonaError> {
        let lib = Arc::new(PersonaLibrary::load(directory)?);
        self.lock()
            .insert(directory.to_path_buf(), Arc::clone(&lib));
        Ok(lib)
    }

    pub fn invalidate(&self, directory: &Path) {
        self.lock().remove(directory);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<PersonaLibrary>>> {
        self.libraries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
