use std::{
    fs::{self, File},
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Permissions postgres insists on for a data directory.
pub const PGDATA_DIR_MODE: u32 = 0o700;

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let original_path = original_path.as_ref();
    let new_extension = match original_path.extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.with_extension(new_extension)
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> anyhow::Result<()> {
    let parent = file_path
        .parent()
        .with_context(|| format!("File {file_path} has no parent"))?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {path}"))
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {path}"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!("Error during path {path} metadata retrieval: {e}"),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => anyhow::bail!("can't find parent of path '{path}'"),
        }
    }

    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path).with_context(|| format!("Failed to create directory {path}"))?;
    }

    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Creates a single directory with `mode` permissions, regardless of umask,
/// and fsyncs it together with its parent.
pub fn create_dir_with_mode(path: &Utf8Path, mode: u32) -> anyhow::Result<()> {
    fs::DirBuilder::new()
        .mode(mode)
        .create(path)
        .with_context(|| format!("Failed to create directory {path}"))?;
    // DirBuilder applies the umask
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {path}"))?;
    fsync_file_and_parent(path).context("failed to fsync created directory")?;
    Ok(())
}

/// Replaces `path` with `contents` through a temporary sibling file and a rename.
/// Readers see either the old file or the complete new one.
pub fn durable_write(path: &Utf8Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path_with_suffix_extension(path, "___temp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temporary file {tmp_path}"))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write {tmp_path}"))?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync {tmp_path}"))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {tmp_path} into {path}"))?;
    fsync_file_and_parent(path)
}
