// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Containment of request paths under the managed download root.
//!
//! Every path-accepting operation goes through [`DownloadRoot::resolve`]
//! before any filesystem call. Resolution is lexical first (`..` may never
//! climb above the root) and then physical: the deepest existing ancestor is
//! canonicalized so a symlink inside the root cannot point outside it.

use std::path::{Component, Path, PathBuf};

use crate::error::{HarvestError, HarvestResult};

/// The single directory tree all downloads and file operations are confined to.
#[derive(Debug, Clone)]
pub struct DownloadRoot {
    root: PathBuf,
}

impl DownloadRoot {
    /// Open (and create if missing) the download root.
    pub fn new(path: impl AsRef<Path>) -> HarvestResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(HarvestError::InvalidPath("download root is empty".to_string()));
        }
        std::fs::create_dir_all(path)?;
        let root = path.canonicalize()?;
        Ok(Self { root })
    }

    /// Canonical absolute path of the root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to an absolute path inside the root.
    ///
    /// Relative paths are taken relative to the root. Absolute paths are
    /// accepted only when they already lie inside it. Empty input and `"."`
    /// resolve to the root.
    pub fn resolve(&self, input: &str) -> HarvestResult<PathBuf> {
        if input.contains('\0') {
            return Err(HarvestError::InvalidPath("path contains a NUL byte".to_string()));
        }

        let requested = Path::new(input.trim());
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| HarvestError::PathEscape(input.to_string()))?
                .to_path_buf()
        } else {
            requested.to_path_buf()
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(HarvestError::PathEscape(input.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(HarvestError::PathEscape(input.to_string()));
                }
            }
        }

        self.ensure_physically_contained(&resolved, input)?;
        Ok(resolved)
    }

    /// Check the deepest existing ancestor of `candidate` after following symlinks.
    fn ensure_physically_contained(&self, candidate: &Path, input: &str) -> HarvestResult<()> {
        let mut probe = candidate;
        loop {
            if probe.symlink_metadata().is_ok() {
                let real = probe.canonicalize()?;
                if real.starts_with(&self.root) {
                    return Ok(());
                }
                return Err(HarvestError::PathEscape(input.to_string()));
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => return Err(HarvestError::PathEscape(input.to_string())),
            }
        }
    }

    /// Express an absolute path inside the root as a `/`-separated relative path.
    pub fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .map(|rel| {
                rel.components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    /// True when `absolute` is the root itself.
    pub fn is_root(&self, absolute: &Path) -> bool {
        absolute == self.root
    }
}
