//! Schema and table names may contain spaces, so lines are never trimmed of
//! anything but their terminating newline.

use std::fs;
use std::io::Write;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::crashsafe_dir;

pub fn get_lines_from_file(path: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    Ok(content.split_terminator('\n').map(str::to_string).collect())
}

fn render_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line.as_ref().trim_matches('\n'));
        buf.push('\n');
    }
    buf
}

/// Durably replaces `path` with one line per entry. An empty slice produces
/// a zero-byte file.
pub fn write_lines_to_file<S: AsRef<str>>(path: &Utf8Path, lines: &[S]) -> anyhow::Result<()> {
    crashsafe_dir::durable_write(path, render_lines(lines).as_bytes())
}

/// Appends a single line, creating the file if needed.
pub fn append_line_to_file(path: &Utf8Path, line: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {path} for append"))?;
    writeln!(file, "{}", line.trim_matches('\n')).with_context(|| format!("Failed to append to {path}"))?;
    file.sync_all().with_context(|| format!("Failed to fsync {path}"))?;
    Ok(())
}

pub fn verify_lines_in_file<S: AsRef<str>>(path: &Utf8Path, expected: &[S]) -> anyhow::Result<()> {
    let lines = get_lines_from_file(path)?;
    let matches = lines.len() == expected.len()
        && lines
            .iter()
            .zip(expected)
            .all(|(read, expected)| read == expected.as_ref().trim_matches('\n'));
    if !matches {
        let expected: Vec<&str> = expected.iter().map(AsRef::as_ref).collect();
        bail!(
            "After writing file '{path}' contents not as expected.\nLines read from file: {lines:?}\nLines expected from file: {expected:?}"
        );
    }
    Ok(())
}

/// Writes `lines` to `path` and checks that reading the file back gives the same lines.
pub fn write_and_verify<S: AsRef<str>>(path: &Utf8Path, lines: &[S]) -> anyhow::Result<()> {
    write_lines_to_file(path, lines)?;
    verify_lines_in_file(path, lines)
}

/// Persists `entries` into a new file in the system temporary directory and
/// returns its path. Returns `None` without creating anything when there are
/// no entries.
pub fn create_temp_file_from_list<S: AsRef<str>>(
    entries: &[S],
    prefix: &str,
) -> anyhow::Result<Option<Utf8PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }

    let mut tmp = camino_tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .context("Failed to create temporary file")?;
    tmp.write_all(render_lines(entries).as_bytes())
        .with_context(|| format!("Failed to write {}", tmp.path()))?;
    let (_, path) = tmp.keep().context("Failed to persist temporary file")?;
    Ok(Some(path))
}
