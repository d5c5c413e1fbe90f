use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{FleetwireError, Result};
use crate::filesync::archive::{self, Entry};

/// Defines which files belong to a sync group, relative to `root`.
///
/// Diffing is file-level: only changed or new files are transferred. Wire
/// paths are `/`-separated regardless of platform.
pub struct SyncSpec {
    root: PathBuf,
    includes: Option<GlobSet>,
    excludes: GlobSet,
    delete_extraneous: bool,
}

pub struct ApplyOutcome {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
}

impl SyncSpec {
    pub fn builder(root: impl Into<PathBuf>) -> SyncSpecBuilder {
        SyncSpecBuilder {
            root: root.into(),
            includes: Vec::new(),
            excludes: Vec::new(),
            delete_extraneous: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn delete_extraneous(&self) -> bool {
        self.delete_extraneous
    }

    /// Whether a wire path is part of this group. Absolute paths and paths
    /// containing `..` never match.
    pub fn matches(&self, wire_path: &str) -> bool {
        let path = Path::new(wire_path);
        if path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return false;
        }
        let included = match &self.includes {
            None => true,
            Some(set) => set.is_match(wire_path),
        };
        included && !self.excludes.is_match(wire_path)
    }

    /// Map of wire path to content sha256 for every matching regular file.
    pub fn compute_manifest(&self) -> Result<BTreeMap<String, String>> {
        let mut manifest = BTreeMap::new();
        if !self.root.exists() {
            return Ok(manifest);
        }
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            let wire_path = to_wire_path(relative);
            if !self.matches(&wire_path) {
                continue;
            }
            let bytes =
                fs::read(entry.path()).map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            manifest.insert(wire_path, archive::sha256_hex(&bytes));
        }
        Ok(manifest)
    }

    /// Builds the transfer payload for the given wire paths. Paths that no
    /// longer match the spec or are not regular files are skipped.
    pub fn build_archive(&self, wire_paths: &BTreeSet<String>) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        for wire_path in wire_paths {
            if wire_path.trim().is_empty() || !self.matches(wire_path) {
                continue;
            }
            let file = self.resolve_safe(wire_path)?;
            match fs::metadata(&file) {
                Ok(metadata) if metadata.is_file() => {}
                _ => continue,
            }
            let data = fs::read(&file).map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            entries.push(Entry {
                path: wire_path.clone(),
                data,
            });
        }
        Ok(archive::pack(&entries))
    }

    /// Extracts a transfer payload into the root (temp file plus atomic
    /// rename per entry), then deletes the given paths where they still match
    /// the spec's filters.
    pub fn apply_archive(&self, payload: &[u8], delete_paths: &[String]) -> Result<ApplyOutcome> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(|e| FleetwireError::Runtime(e.to_string()))?;
        }

        let mut written = Vec::new();
        for entry in archive::unpack(payload)? {
            let name = entry.path;
            if name.trim().is_empty() || name.starts_with('/') || name.starts_with('\\') {
                continue;
            }
            if !self.matches(&name) {
                continue;
            }
            let target = self.resolve_safe(&name)?;
            let parent = target.parent().unwrap_or(&self.root).to_path_buf();
            fs::create_dir_all(&parent).map_err(|e| FleetwireError::Runtime(e.to_string()))?;

            let mut tmp = tempfile::Builder::new()
                .prefix(".fleetwire-")
                .suffix(".tmp")
                .tempfile_in(&parent)
                .map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            tmp.write_all(&entry.data)
                .map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            tmp.flush()
                .map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            tmp.persist(&target)
                .map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            written.push(name);
        }

        let mut deleted = Vec::new();
        for wire_path in delete_paths {
            if wire_path.trim().is_empty() || !self.matches(wire_path) {
                continue;
            }
            let target = self.resolve_safe(wire_path)?;
            match fs::metadata(&target) {
                Ok(metadata) if metadata.is_file() => {}
                _ => continue,
            }
            fs::remove_file(&target).map_err(|e| FleetwireError::Runtime(e.to_string()))?;
            deleted.push(wire_path.clone());
        }

        Ok(ApplyOutcome { written, deleted })
    }

    /// Containment guard: resolves a wire path under the root, rejecting
    /// anything absolute or escaping.
    fn resolve_safe(&self, wire_path: &str) -> Result<PathBuf> {
        let relative = Path::new(wire_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(FleetwireError::Runtime(format!(
                "unsafe relative path: {wire_path}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

pub struct SyncSpecBuilder {
    root: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    delete_extraneous: bool,
}

impl SyncSpecBuilder {
    pub fn include_glob(mut self, glob: impl Into<String>) -> Self {
        let glob = glob.into();
        if !glob.trim().is_empty() {
            self.includes.push(glob);
        }
        self
    }

    pub fn exclude_glob(mut self, glob: impl Into<String>) -> Self {
        let glob = glob.into();
        if !glob.trim().is_empty() {
            self.excludes.push(glob);
        }
        self
    }

    pub fn delete_extraneous(mut self, delete_extraneous: bool) -> Self {
        self.delete_extraneous = delete_extraneous;
        self
    }

    pub fn build(self) -> Result<SyncSpec> {
        let includes = if self.includes.is_empty() {
            None
        } else {
            Some(build_glob_set(&self.includes)?)
        };
        let excludes = build_glob_set(&self.excludes)?;
        Ok(SyncSpec {
            root: self.root,
            includes,
            excludes,
            delete_extraneous: self.delete_extraneous,
        })
    }
}

fn build_glob_set(globs: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(Glob::new(glob).map_err(|e| FleetwireError::Config(e.to_string()))?);
    }
    builder
        .build()
        .map_err(|e| FleetwireError::Config(e.to_string()))
}

fn to_wire_path(relative: &Path) -> String {
    let text = relative.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
