//! Generated bundles and where they come from
//!
//! A bundle is the output of the generation step for one project: the source
//! files, the setup commands, the dependency lists and environment defaults.
//! The sandbox only reads bundles; storage is behind [`BundleSource`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that occur while loading a bundle
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("no completed generation found for project '{0}'")]
    NotFound(String),

    #[error("invalid project id '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidProjectId(String),

    #[error("generated files are not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to read bundle record at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A package dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// A setup command declared by the generator (e.g. a schema migration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupCommand {
    /// Command line, split into program and arguments before running
    pub command: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub category: String,

    /// Sort key; ties keep declaration order
    #[serde(default)]
    pub order: i64,
}

/// Main and development dependency lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub main: Vec<Dependency>,

    #[serde(default)]
    pub dev: Vec<Dependency>,
}

/// Files and instructions produced by one generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedBundle {
    /// Relative path to text content
    pub files: BTreeMap<String, String>,

    pub setup_commands: Vec<SetupCommand>,

    pub dependencies: Dependencies,

    /// Environment variable defaults
    pub env: BTreeMap<String, String>,
}

impl GeneratedBundle {
    /// Setup commands sorted by `order`, declaration order breaking ties
    pub fn ordered_setup_commands(&self) -> Vec<&SetupCommand> {
        let mut commands: Vec<&SetupCommand> = self.setup_commands.iter().collect();
        // sort_by_key is stable, so equal orders keep their list position
        commands.sort_by_key(|c| c.order);
        commands
    }
}

/// A generation record as persisted by the storage layer
///
/// The file map is stored as a JSON text blob and only parsed when the record
/// is turned into a [`GeneratedBundle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGeneration {
    pub generated_files: String,

    #[serde(default)]
    pub setup_commands: Vec<SetupCommand>,

    #[serde(default)]
    pub dependencies: Dependencies,

    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
}

impl StoredGeneration {
    /// Parse the file blob and assemble a bundle
    pub fn into_bundle(self) -> Result<GeneratedBundle, BundleError> {
        let files: BTreeMap<String, String> =
            serde_json::from_str(&self.generated_files).map_err(BundleError::Parse)?;

        Ok(GeneratedBundle {
            files,
            setup_commands: self.setup_commands,
            dependencies: self.dependencies,
            env: self.env_variables,
        })
    }

    /// Build a record from a bundle (used by tools that write fixtures)
    pub fn from_bundle(bundle: &GeneratedBundle) -> Self {
        Self {
            // A string map always serializes
            generated_files: serde_json::to_string(&bundle.files).unwrap_or_default(),
            setup_commands: bundle.setup_commands.clone(),
            dependencies: bundle.dependencies.clone(),
            env_variables: bundle.env.clone(),
        }
    }
}

/// Check that a project id is safe to use as a file and directory name
pub fn validate_project_id(project_id: &str) -> Result<(), BundleError> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(BundleError::InvalidProjectId(project_id.to_string()))
    }
}

/// Read access to the latest completed generation of a project
#[async_trait]
pub trait BundleSource: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<GeneratedBundle, BundleError>;
}

/// Bundles stored as `<root>/<project_id>.json` records
#[derive(Debug, Clone)]
pub struct FsBundleSource {
    root: PathBuf,
}

impl FsBundleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, project_id: &str) -> PathBuf {
        self.root.join(format!("{project_id}.json"))
    }
}

/// Read and parse a single stored record
pub async fn read_record(path: &Path) -> Result<GeneratedBundle, BundleError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BundleError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let record: StoredGeneration = serde_json::from_str(&content).map_err(BundleError::Parse)?;
    record.into_bundle()
}

#[async_trait]
impl BundleSource for FsBundleSource {
    #[instrument(skip(self))]
    async fn load(&self, project_id: &str) -> Result<GeneratedBundle, BundleError> {
        validate_project_id(project_id)?;

        let path = self.record_path(project_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BundleError::NotFound(project_id.to_string()));
        }

        let bundle = read_record(&path).await?;
        debug!(
            files = bundle.files.len(),
            setup_commands = bundle.setup_commands.len(),
            "loaded bundle"
        );
        Ok(bundle)
    }
}

/// Bundles held in memory
#[derive(Debug, Default)]
pub struct MemoryBundleSource {
    records: RwLock<HashMap<String, StoredGeneration>>,
}

impl MemoryBundleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a bundle for `project_id`, replacing any previous one
    pub fn insert(&self, project_id: impl Into<String>, bundle: &GeneratedBundle) {
        self.insert_record(project_id, StoredGeneration::from_bundle(bundle));
    }

    /// Store a raw record (the file blob is parsed on load)
    pub fn insert_record(&self, project_id: impl Into<String>, record: StoredGeneration) {
        if let Ok(mut records) = self.records.write() {
            records.insert(project_id.into(), record);
        }
    }
}

#[async_trait]
impl BundleSource for MemoryBundleSource {
    async fn load(&self, project_id: &str) -> Result<GeneratedBundle, BundleError> {
        validate_project_id(project_id)?;

        let record = self
            .records
            .read()
            .ok()
            .and_then(|records| records.get(project_id).cloned())
            .ok_or_else(|| BundleError::NotFound(project_id.to_string()))?;

        record.into_bundle()
    }
}
