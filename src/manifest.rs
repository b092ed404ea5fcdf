use crate::enricher::TriggersAnnotationEnricher;
use crate::workload::Workload;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// A generated resource: a recognized workload, or anything else kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestResource {
    Workload(Workload),
    Other(Value),
}

impl ManifestResource {
    pub fn from_value(value: Value) -> Self {
        match Workload::from_value(&value) {
            Ok(Some(workload)) => ManifestResource::Workload(workload),
            Ok(None) => ManifestResource::Other(value),
            Err(e) => {
                warn!("Keeping resource untouched, its containers do not parse: {}", e);
                ManifestResource::Other(value)
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ManifestResource::Workload(workload) => workload.value().clone(),
            ManifestResource::Other(value) => value.clone(),
        }
    }
}

fn is_list(map: &serde_json::Map<String, Value>) -> bool {
    map.get("kind").and_then(Value::as_str) == Some("List")
}

#[derive(Debug, Clone, PartialEq)]
enum Document {
    Single(ManifestResource),
    /// A `kind: List` document, `header` holds everything except the items.
    List {
        header: Value,
        items: Vec<ManifestResource>,
    },
}

/// A YAML manifest file with one or more documents.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestFile {
    path: PathBuf,
    documents: Vec<Document>,
}

impl ManifestFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let mut documents = Vec::new();
        for document in serde_yaml_ng::Deserializer::from_str(content) {
            let value = Value::deserialize(document)
                .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;
            match value {
                Value::Null => continue,
                Value::Object(mut map) if is_list(&map) => {
                    let items = match map.remove("items") {
                        Some(Value::Array(items)) => items,
                        Some(Value::Null) | None => Vec::new(),
                        Some(_) => {
                            anyhow::bail!("List in {} has non-array items", path.display())
                        }
                    };
                    documents.push(Document::List {
                        header: Value::Object(map),
                        items: items.into_iter().map(ManifestResource::from_value).collect(),
                    });
                }
                value => documents.push(Document::Single(ManifestResource::from_value(value))),
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            documents,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resources_mut(&mut self) -> impl Iterator<Item = &mut ManifestResource> {
        self.documents.iter_mut().flat_map(|document| match document {
            Document::Single(resource) => std::slice::from_mut(resource).iter_mut(),
            Document::List { items, .. } => items.iter_mut(),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut rendered = Vec::with_capacity(self.documents.len());
        for document in &self.documents {
            let value = match document {
                Document::Single(resource) => resource.to_value(),
                Document::List { header, items } => {
                    let mut list = header.clone();
                    let items = items.iter().map(ManifestResource::to_value).collect();
                    if let Value::Object(map) = &mut list {
                        map.insert("items".to_string(), Value::Array(items));
                    }
                    list
                }
            };
            rendered.push(serde_yaml_ng::to_string(&value).context("Failed to render YAML")?);
        }
        Ok(rendered.join("---\n"))
    }

    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, self.to_yaml()?)
            .with_context(|| format!("Failed to write manifest file: {}", self.path.display()))
    }
}

/// Outcome of enriching all manifests under a directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub files: usize,
    pub annotated: usize,
    pub failed: Vec<PathBuf>,
}

/// Finds files under `dir` whose path relative to `dir` matches one of `include`.
pub fn find_manifests(dir: &Path, include: &[String]) -> Result<Vec<PathBuf>> {
    let mut builder = GlobSetBuilder::new();
    for pattern in include {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern {}", pattern))?;
        builder.add(glob);
    }
    let globs = builder.build().context("Failed to build manifest include globs")?;

    let mut found = Vec::new();
    collect_matching(dir, dir, &globs, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_matching(
    root: &Path,
    dir: &Path,
    globs: &GlobSet,
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read directory entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_matching(root, &path, globs, found)?;
        } else if path.strip_prefix(root).is_ok_and(|relative| globs.is_match(relative)) {
            found.push(path);
        }
    }
    Ok(())
}

/// Enriches every matching manifest under `dir`, one file failing never stops the others.
pub fn enrich_manifests(
    dir: &Path,
    include: &[String],
    enricher: &TriggersAnnotationEnricher,
) -> Result<EnrichSummary> {
    let mut summary = EnrichSummary::default();
    for path in find_manifests(dir, include)? {
        summary.files += 1;
        let result = ManifestFile::load(&path).and_then(|mut manifest| {
            let annotated = enricher.enrich(manifest.resources_mut());
            if annotated == 0 {
                return Ok(0);
            }
            manifest.save()?;
            info!(
                "Annotated {} workloads in {}",
                annotated,
                manifest.path().display()
            );
            Ok(annotated)
        });
        match result {
            Ok(annotated) => summary.annotated += annotated,
            Err(e) => {
                error!("Failed to enrich manifest {}: {:?}", path.display(), e);
                summary.failed.push(path);
            }
        }
    }
    Ok(summary)
}
