//! Destination naming for received files.
//!
//! Stored names are always prefixed so that an inbound file never clobbers a
//! same-named local file, and a numeric suffix is added when the prefixed
//! name is already taken.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};

use rendezvous_shared::constants::RECEIVED_FILE_PREFIX;

const FALLBACK_NAME: &str = "unnamed";

/// Upper bound on suffix attempts before giving up.
const MAX_COLLISION_ATTEMPTS: u32 = 10_000;

/// Reduce a peer-supplied file name to a single safe path component.
pub fn sanitize_file_name(raw: &str) -> String {
    let normalized = raw.replace('\\', "/");
    let last = Path::new(&normalized)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .last()
        .unwrap_or("");

    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Name of the `attempt`-th candidate for `file_name`:
/// `received_name.ext`, then `received_name (1).ext`, ...
fn candidate_name(file_name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return format!("{RECEIVED_FILE_PREFIX}{file_name}");
    }

    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{RECEIVED_FILE_PREFIX}{stem} ({attempt}).{ext}")
        }
        _ => format!("{RECEIVED_FILE_PREFIX}{file_name} ({attempt})"),
    }
}

/// Create a fresh destination file inside `download_dir`.
///
/// Uses `create_new` so that two concurrent jobs with the same file name
/// always end up in different files.
pub async fn create_destination(
    download_dir: &Path,
    raw_name: &str,
) -> std::io::Result<(PathBuf, File)> {
    fs::create_dir_all(download_dir).await?;
    let file_name = sanitize_file_name(raw_name);

    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        let path = download_dir.join(candidate_name(&file_name, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free destination name for '{file_name}'"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\bob\\photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("/abs/path/data.bin"), "data.bin");
    }

    #[test]
    fn test_sanitize_falls_back_for_empty_names() {
        assert_eq!(sanitize_file_name(""), FALLBACK_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("/"), FALLBACK_NAME);
    }

    #[test]
    fn test_candidate_names() {
        assert_eq!(candidate_name("a.txt", 0), "received_a.txt");
        assert_eq!(candidate_name("a.txt", 2), "received_a (2).txt");
        assert_eq!(candidate_name("README", 1), "received_README (1)");
        assert_eq!(candidate_name(".bashrc", 1), "received_.bashrc (1)");
    }

    #[tokio::test]
    async fn test_collisions_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();

        // A local file with the original name is never touched.
        fs::write(dir.path().join("a.txt"), b"local").await.unwrap();

        let (first, _) = create_destination(dir.path(), "a.txt").await.unwrap();
        let (second, _) = create_destination(dir.path(), "a.txt").await.unwrap();

        assert_eq!(first, dir.path().join("received_a.txt"));
        assert_eq!(second, dir.path().join("received_a (1).txt"));
        assert_eq!(fs::read(dir.path().join("a.txt")).await.unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_creates_missing_download_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("downloads").join("inbox");

        let (path, _) = create_destination(&nested, "x.bin").await.unwrap();
        assert!(path.starts_with(&nested));
        assert!(path.exists());
    }
}
