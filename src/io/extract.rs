//! Built-in archive extraction.
//!
//! Used by the unpack stage when a descriptor declares no explicit
//! unpack commands. Handles tar, tar.gz and tar.zst archives; anything
//! else needs descriptor-declared commands.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported archive format for '{0}'; declare unpack commands instead")]
    UnsupportedFormat(String),
}

enum Format {
    Tar,
    TarGz,
    TarZst,
}

fn detect(url: &str) -> Result<Format, ExtractError> {
    let lower = url.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Ok(Format::TarGz)
    } else if lower.ends_with(".tar.zst") {
        Ok(Format::TarZst)
    } else if lower.ends_with(".tar") {
        Ok(Format::Tar)
    } else {
        Err(ExtractError::UnsupportedFormat(url.to_string()))
    }
}

/// Extract archive bytes into `dest`, stripping `strip_components`
/// leading path components (the usual single top-level directory).
pub fn unpack(
    data: &[u8],
    url: &str,
    dest: &Path,
    strip_components: u32,
) -> Result<(), ExtractError> {
    match detect(url)? {
        Format::Tar => unpack_tar(data, dest, strip_components),
        Format::TarGz => unpack_tar(flate2::read::GzDecoder::new(data), dest, strip_components),
        Format::TarZst => unpack_tar(
            zstd::stream::Decoder::new(data).map_err(ExtractError::Io)?,
            dest,
            strip_components,
        ),
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path, strip_components: u32) -> Result<(), ExtractError> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();

        // Refuse anything that would escape the destination.
        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            tracing::warn!(path = %entry_path.display(), "skipping unsafe archive entry");
            continue;
        }

        let stripped: PathBuf = entry_path
            .components()
            .skip(strip_components as usize)
            .collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(stripped);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}
