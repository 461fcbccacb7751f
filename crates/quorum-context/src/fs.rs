// Filesystem Access Module
// Metadata reads, content hashing and recursive walks used by change
// detection and bootstrap.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use sha2::{Digest, Sha256};

use crate::error::{ContextError, ContextResult};

/// On-disk facts about one regular file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub abs_path: PathBuf,
    pub size_bytes: u64,
    pub mtime_ns: i64,
    pub content_hash: String,
}

/// Read size, mtime (ns) and a sha256 content hash for a regular file.
/// Hashing runs on the blocking pool.
pub async fn read_meta(path: &Path) -> ContextResult<FileMeta> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_meta_blocking(&path))
        .await
        .map_err(|err| ContextError::Chunking(format!("metadata task join error: {err}")))?
}

fn read_meta_blocking(path: &Path) -> ContextResult<FileMeta> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(ContextError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )));
    }
    let mtime_ns = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    let content_hash = hex_digest(&hasher.finalize());

    Ok(FileMeta {
        abs_path: path.to_path_buf(),
        size_bytes: metadata.len(),
        mtime_ns,
        content_hash,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Recursively walk `root` for regular files, honoring ignore files. The
/// walker follows no symlinks, which also keeps cycles out.
pub async fn walk_files(root: &Path) -> Vec<PathBuf> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkBuilder::new(&root).follow_links(false).build().flatten() {
            if entry.file_type().map(|f| f.is_file()).unwrap_or(false) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        files
    })
    .await
    .unwrap_or_default()
}

/// Normalize an absolute path to a root-relative, forward-slash string.
/// Paths outside the root are rejected.
pub fn relativize(root: &Path, path: &Path) -> ContextResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| ContextError::OutsideRoot(path.to_path_buf()))?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            std::path::Component::ParentDir => {
                return Err(ContextError::OutsideRoot(path.to_path_buf()));
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Best-effort language tag from the file extension.
pub fn language_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "rs" => Some("rust"),
        "py" => Some("python"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" => Some("javascript"),
        "go" => Some("go"),
        "java" => Some("java"),
        "kt" | "kts" => Some("kotlin"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "hpp" => Some("cpp"),
        "md" => Some("markdown"),
        "toml" => Some("toml"),
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "sh" => Some("shell"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn meta_reflects_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let meta = read_meta(&path).await.unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert!(meta.mtime_ns > 0);

        std::fs::write(&path, "world!").unwrap();
        let changed = read_meta(&path).await.unwrap();
        assert_ne!(changed.content_hash, meta.content_hash);
        assert_eq!(changed.size_bytes, 6);
    }

    #[tokio::test]
    async fn meta_rejects_directories() {
        let dir = TempDir::new().unwrap();
        assert!(read_meta(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn walk_finds_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/nested/b.rs"), "y").unwrap();

        let files = walk_files(dir.path()).await;
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn relativize_rejects_escapes() {
        let root = Path::new("/project");
        assert_eq!(
            relativize(root, Path::new("/project/src/main.rs")).unwrap(),
            "src/main.rs"
        );
        assert!(relativize(root, Path::new("/elsewhere/file.rs")).is_err());
    }
}
