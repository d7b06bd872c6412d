use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::flows::binder::ParamSpec;

/// Declared shape of a flow type: its fully-qualified name and the ordered
/// parameter list the remote engine invokes it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl FlowDescriptor {
    pub fn new(name: impl Into<String>, parameters: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Flow class [{0}] not found")]
    FlowClassNotFound(String),

    #[error("Flow location not found: {}", .0.display())]
    LocationNotFound(PathBuf),
}

/// A deployable manifest file listing flow descriptors.
#[derive(Debug, Deserialize)]
struct FlowManifest {
    #[serde(default)]
    flows: Vec<FlowDescriptor>,
}

/// Registry of flow types known to the gateway.
///
/// Flows come from two places: descriptors registered in code, and manifest
/// files deployed to external locations. Manifests are read on every lookup,
/// so a flow dropped into a location is resolvable without a restart.
pub struct FlowRegistry {
    flows: HashMap<String, Arc<FlowDescriptor>>,
    locations: RwLock<Vec<PathBuf>>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            locations: RwLock::new(Vec::new()),
        }
    }

    /// Create a registry that consults the given external locations.
    pub async fn with_locations<P: AsRef<Path>>(locations: &[P]) -> Result<Self, ResolveError> {
        let registry = Self::new();
        for location in locations {
            registry.append_location(location).await?;
        }
        Ok(registry)
    }

    /// Register a flow descriptor in code. Replaces any previous registration
    /// under the same name.
    pub fn register(&mut self, descriptor: FlowDescriptor) {
        self.flows
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    /// Add an external location (manifest file or directory of manifests).
    pub async fn append_location(&self, location: impl AsRef<Path>) -> Result<(), ResolveError> {
        let path = location.as_ref();
        let real = tokio::fs::canonicalize(path)
            .await
            .map_err(|_| ResolveError::LocationNotFound(path.to_path_buf()))?;

        let mut locations = self.locations.write().await;
        if !locations.contains(&real) {
            debug!(location = %real.display(), "Added flow location");
            locations.push(real);
        }
        Ok(())
    }

    pub async fn locations(&self) -> Vec<PathBuf> {
        self.locations.read().await.clone()
    }

    /// Resolve a flow type by its fully-qualified name.
    pub async fn resolve(&self, name: &str) -> Result<Arc<FlowDescriptor>, ResolveError> {
        if let Some(descriptor) = self.flows.get(name) {
            return Ok(descriptor.clone());
        }

        for location in self.locations().await {
            for descriptor in load_location(&location).await {
                if descriptor.name == name {
                    return Ok(Arc::new(descriptor));
                }
            }
        }

        Err(ResolveError::FlowClassNotFound(name.to_string()))
    }

    /// All resolvable descriptors, sorted by name. Code registrations shadow
    /// manifest entries, earlier locations shadow later ones.
    pub async fn list(&self) -> Vec<Arc<FlowDescriptor>> {
        let mut seen: HashMap<String, Arc<FlowDescriptor>> = self.flows.clone();

        for location in self.locations().await {
            for descriptor in load_location(&location).await {
                seen.entry(descriptor.name.clone())
                    .or_insert_with(|| Arc::new(descriptor));
            }
        }

        let mut entries: Vec<Arc<FlowDescriptor>> = seen.into_values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

async fn load_location(location: &Path) -> Vec<FlowDescriptor> {
    let files = match tokio::fs::metadata(location).await {
        Ok(meta) if meta.is_dir() => match manifest_files(location).await {
            Ok(files) => files,
            Err(e) => {
                warn!(location = %location.display(), error = %e, "Failed to list flow location");
                return Vec::new();
            }
        },
        Ok(_) => vec![location.to_path_buf()],
        Err(e) => {
            warn!(location = %location.display(), error = %e, "Flow location is no longer readable");
            return Vec::new();
        }
    };

    let mut descriptors = Vec::new();
    for file in files {
        match load_manifest(&file).await {
            Ok(manifest) => descriptors.extend(manifest.flows),
            Err(e) => warn!(manifest = %file.display(), error = %e, "Skipping malformed flow manifest"),
        }
    }
    descriptors
}

async fn manifest_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_manifest(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// YAML manifests go through a JSON value so that parameter types use the
/// same `{list: string}` map form in both formats.
async fn load_manifest(path: &Path) -> anyhow::Result<FlowManifest> {
    let contents = tokio::fs::read_to_string(path).await?;
    let value: serde_json::Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&contents)?
    } else {
        serde_yml::from_str(&contents)?
    };
    Ok(serde_json::from_value(value)?)
}
