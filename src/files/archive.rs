// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive format detection and unpacking.
//!
//! Unpacking is blocking and runs on tokio's blocking pool. Members whose
//! names would land outside the target directory are skipped.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::Archive;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::error::{HarvestError, HarvestResult};
use crate::types::ArchiveFormat;

/// Extensions recognised as archives.
const SUPPORTED: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::TarGz),
    (".tgz", ArchiveFormat::TarGz),
    (".tar.bz2", ArchiveFormat::TarBz2),
    (".tbz2", ArchiveFormat::TarBz2),
    (".tar.xz", ArchiveFormat::TarXz),
    (".txz", ArchiveFormat::TarXz),
    (".tar", ArchiveFormat::Tar),
    (".zip", ArchiveFormat::Zip),
];

/// Recognised as archives for listings, but not unpacked.
const UNSUPPORTED: &[&str] = &[".7z", ".rar"];

fn archive_extension(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    SUPPORTED
        .iter()
        .map(|(ext, _)| *ext)
        .chain(UNSUPPORTED.iter().copied())
        .filter(|ext| lower.ends_with(ext) && lower.len() > ext.len())
        .max_by_key(|ext| ext.len())
}

/// True if the file name looks like any known archive type.
pub fn is_archive(name: &str) -> bool {
    archive_extension(name).is_some()
}

/// Pick the unpacker for a file name.
pub fn detect_format(name: &str) -> HarvestResult<ArchiveFormat> {
    let lower = name.to_ascii_lowercase();
    match archive_extension(name) {
        Some(ext) => SUPPORTED
            .iter()
            .find(|(candidate, _)| *candidate == ext)
            .map(|(_, format)| *format)
            .ok_or_else(|| HarvestError::UnsupportedArchive(format!("{} archives are not supported", ext))),
        None => Err(HarvestError::UnsupportedArchive(format!("{} is not an archive", lower))),
    }
}

/// File name with its archive extension removed (`a.tar.gz` -> `a`).
pub fn strip_archive_extension(name: &str) -> &str {
    match archive_extension(name) {
        Some(ext) => &name[..name.len() - ext.len()],
        None => name,
    }
}

/// Unpack `archive` into `target`, returning the number of members written.
pub fn unpack(format: ArchiveFormat, archive: &Path, target: &Path) -> Result<u64> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;

    let file = File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    match format {
        ArchiveFormat::Zip => unpack_zip(file, target),
        ArchiveFormat::Tar => unpack_tar(Archive::new(BufReader::new(file)), target),
        ArchiveFormat::TarGz => unpack_tar(Archive::new(GzDecoder::new(BufReader::new(file))), target),
        ArchiveFormat::TarBz2 => unpack_tar(Archive::new(BzDecoder::new(BufReader::new(file))), target),
        ArchiveFormat::TarXz => unpack_tar(Archive::new(XzDecoder::new(BufReader::new(file))), target),
    }
}

fn unpack_tar<R: std::io::Read>(mut archive: Archive<R>, target: &Path) -> Result<u64> {
    let mut written = 0;
    for entry in archive.entries().context("failed to read tar entries")? {
        let mut entry = entry.context("corrupt tar entry")?;
        // unpack_in refuses members that would escape the target
        if entry.unpack_in(target).context("failed to unpack tar entry")? {
            written += 1;
        } else {
            tracing::warn!(
                target: "harvester::files",
                member = %entry.path().map(|p| p.display().to_string()).unwrap_or_default(),
                "Skipped archive member outside the target"
            );
        }
    }
    Ok(written)
}

fn unpack_zip(file: File, target: &Path) -> Result<u64> {
    let mut archive = ZipArchive::new(BufReader::new(file)).context("not a valid zip archive")?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut member = archive.by_index(i).context("corrupt zip entry")?;
        let outpath = match member.enclosed_name() {
            Some(path) => target.join(path),
            None => {
                tracing::warn!(
                    target: "harvester::files",
                    member = member.name(),
                    "Skipped archive member outside the target"
                );
                continue;
            }
        };

        if member.is_dir() {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)
                .with_context(|| format!("failed to create {}", outpath.display()))?;
            std::io::copy(&mut member, &mut outfile)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = member.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
        written += 1;
    }
    Ok(written)
}
