/// Small filesystem helpers shared by the tools.
use std::{io, path::Path};

use anyhow::Context;

/// Errors when `path` is missing or is not a directory.
pub async fn is_directory_empty(path: impl AsRef<Path>) -> anyhow::Result<bool> {
    let mut dir = tokio::fs::read_dir(&path)
        .await
        .context(format!("read_dir({})", path.as_ref().display()))?;
    Ok(dir.next_entry().await?.is_none())
}

pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod test {
    use super::{ignore_not_found, is_directory_empty};

    #[tokio::test]
    async fn directory_emptiness() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dir_path = dir.path();

        assert!(is_directory_empty(dir_path).await.unwrap());

        let pid = dir_path.join("postmaster.pid");
        std::fs::write(&pid, b"").unwrap();
        assert!(!is_directory_empty(dir_path).await.unwrap());

        // a file or a missing path is an error, not "empty"
        assert!(is_directory_empty(&pid).await.is_err());
        assert!(is_directory_empty(dir_path.join("missing")).await.is_err());
    }

    #[test]
    fn ignore_not_found_works() {
        let dir = camino_tempfile::tempdir().unwrap();
        let stale_pid = dir.path().join("postmaster.pid");

        std::fs::remove_file(&stale_pid)
            .or_else(ignore_not_found)
            .expect("removing a missing file is fine");

        let dir_err = std::fs::remove_file(dir.path()).unwrap_err();
        assert!(ignore_not_found(dir_err).is_err());
    }
}
