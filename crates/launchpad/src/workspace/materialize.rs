//! Writing generated files and the package manifest into a workspace

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::bundle::{Dependencies, Dependency};
use crate::config::ManifestConfig;
use crate::workspace::{Workspace, WorkspaceError};

/// What happened to each file of a bundle
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Relative paths that were written
    pub written: Vec<String>,

    /// Paths that were rejected or failed to write
    pub skipped: Vec<(String, WorkspaceError)>,
}

impl MaterializeReport {
    /// One warning line per skipped file
    pub fn warnings(&self) -> Vec<String> {
        self.skipped
            .iter()
            .map(|(path, err)| format!("skipped file '{path}': {err}"))
            .collect()
    }
}

/// Write every file of `files` into the workspace
///
/// Files are written concurrently. A file whose path escapes the workspace,
/// or whose write fails, is skipped and reported; the rest still land. When
/// several names resolve to the same file, the first in bundle order is written
/// and the others are skipped.
#[instrument(skip(workspace, files), fields(count = files.len()))]
pub async fn write_files(
    workspace: &Workspace,
    files: &BTreeMap<String, String>,
) -> MaterializeReport {
    let mut report = MaterializeReport::default();
    let mut writes = JoinSet::new();
    let mut claimed: HashMap<PathBuf, String> = HashMap::new();

    for (name, content) in files {
        let path = match workspace.file_path(name) {
            Ok(path) => path,
            Err(e) => {
                warn!(name = %name, "rejecting generated file outside the workspace");
                report.skipped.push((name.clone(), e));
                continue;
            }
        };
        if let Some(first) = claimed.get(&path) {
            warn!(name = %name, first = %first, "generated file shadowed by an earlier name");
            report
                .skipped
                .push((name.clone(), WorkspaceError::DuplicatePath(first.clone())));
            continue;
        }
        claimed.insert(path.clone(), name.clone());

        let name = name.clone();
        let content = content.clone();
        writes.spawn(async move {
            let result = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content.as_bytes()).await
            }
            .await
            .map_err(|source| WorkspaceError::Write { path, source });
            (name, result)
        });
    }

    while let Some(joined) = writes.join_next().await {
        match joined {
            Ok((name, Ok(()))) => report.written.push(name),
            Ok((name, Err(e))) => {
                warn!(name = %name, error = %e, "failed to write generated file");
                report.skipped.push((name, e));
            }
            Err(e) => warn!(error = %e, "file write task failed"),
        }
    }

    report.written.sort();
    debug!(
        written = report.written.len(),
        skipped = report.skipped.len(),
        "materialized files"
    );
    report
}

/// Make sure the workspace has a usable package manifest
///
/// An existing manifest is kept and patched; a missing or unparsable one is
/// replaced by a minimal one. The configured lifecycle scripts always win over
/// same-named scripts, other scripts survive. Bundle dependencies are added
/// where the manifest does not already declare them.
#[instrument(skip(workspace, dependencies, manifest))]
pub async fn ensure_manifest(
    workspace: &Workspace,
    project_name: &str,
    dependencies: &Dependencies,
    manifest: &ManifestConfig,
) -> Result<(), WorkspaceError> {
    let path = workspace.file_path(&manifest.file_name)?;

    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                warn!(?path, "manifest is not a JSON object, synthesizing a new one");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(WorkspaceError::Io(e)),
    };

    let mut root = existing.unwrap_or_else(|| {
        debug!("synthesizing manifest");
        default_manifest(project_name)
    });

    update_object(&mut root, "scripts", |scripts| {
        for (name, script) in &manifest.scripts {
            scripts.insert(name.clone(), Value::String(script.clone()));
        }
    });
    update_object(&mut root, "dependencies", |deps| {
        merge_dependencies(deps, &dependencies.main);
    });
    update_object(&mut root, "devDependencies", |deps| {
        merge_dependencies(deps, &dependencies.dev);
    });

    let mut text = serde_json::to_string_pretty(&Value::Object(root))
        .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))?;
    text.push('\n');

    tokio::fs::write(&path, text)
        .await
        .map_err(|source| WorkspaceError::Write { path, source })?;
    Ok(())
}

fn default_manifest(project_name: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "name".to_string(),
        Value::String(project_name.to_ascii_lowercase()),
    );
    map.insert("version".to_string(), Value::String("1.0.0".to_string()));
    map.insert("private".to_string(), Value::Bool(true));
    map.insert("dependencies".to_string(), Value::Object(Map::new()));
    map.insert("devDependencies".to_string(), Value::Object(Map::new()));
    map
}

/// Apply `f` to the object at `key`, replacing any non-object value
fn update_object(
    root: &mut Map<String, Value>,
    key: &str,
    f: impl FnOnce(&mut Map<String, Value>),
) {
    let mut object = match root.remove(key) {
        Some(Value::Object(object)) => object,
        _ => Map::new(),
    };
    f(&mut object);
    root.insert(key.to_string(), Value::Object(object));
}

fn merge_dependencies(target: &mut Map<String, Value>, dependencies: &[Dependency]) {
    for dependency in dependencies {
        target
            .entry(dependency.name.clone())
            .or_insert_with(|| Value::String(dependency.version.clone()));
    }
}
