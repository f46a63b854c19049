//! Outgoing file descriptions and directory flattening.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::TransferError;

/// Where an outgoing file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// A file selected for sending: relative path, size and byte source.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub relative_path: String,
    pub size: u64,
    pub source: FileSource,
    pub thumbnail: Option<String>,
}

impl OutgoingFile {
    /// Describes a file on disk, reading its size from metadata.
    pub async fn from_path(
        path: impl Into<PathBuf>,
        relative_path: impl Into<String>,
    ) -> Result<Self, TransferError> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self {
            relative_path: relative_path.into(),
            size,
            source: FileSource::Path(path),
            thumbnail: None,
        })
    }

    /// Describes an in-memory byte buffer.
    pub fn from_bytes(relative_path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            relative_path: relative_path.into(),
            size: bytes.len() as u64,
            source: FileSource::Bytes(bytes),
            thumbnail: None,
        }
    }

    /// Attaches a preview (typically a data URL) sent with the `init` frame.
    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub(crate) async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransferError> {
        match &self.source {
            FileSource::Path(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            FileSource::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
        }
    }
}

/// Walks `root` recursively and returns one [`OutgoingFile`] per regular
/// file, with paths relative to `root`'s parent so the directory name is
/// kept. Separators are normalized to `/`; output is sorted by path.
pub fn collect_files(root: &Path) -> Result<Vec<OutgoingFile>, TransferError> {
    let base = root.parent().unwrap_or(root);
    let mut files = Vec::new();
    walk_dir(base, root, &mut files)?;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn walk_dir(base: &Path, current: &Path, files: &mut Vec<OutgoingFile>) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(base, &path, files)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(base).map_err(std::io::Error::other)?;
            files.push(OutgoingFile {
                relative_path: rel_path.to_string_lossy().replace('\\', "/"),
                size: metadata.len(),
                source: FileSource::Path(path),
                thumbnail: None,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("album");
        fs::create_dir_all(album.join("day1")).unwrap();
        fs::write(album.join("cover.jpg"), b"COVER").unwrap();
        fs::write(album.join("day1").join("beach.jpg"), b"BEACH_PIXELS").unwrap();
        dir
    }

    #[test]
    fn collect_flattens_tree_with_forward_slashes() {
        let dir = create_test_tree();
        let files = collect_files(&dir.path().join("album")).unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["album/cover.jpg", "album/day1/beach.jpg"]);
        assert_eq!(files[1].size, 12);
    }

    #[test]
    fn collect_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(collect_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn collect_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        assert!(collect_files(&dir.path().join("nope")).is_err());
    }

    #[tokio::test]
    async fn from_path_reads_size_and_bytes() {
        let dir = create_test_tree();
        let file = OutgoingFile::from_path(dir.path().join("album/cover.jpg"), "cover.jpg")
            .await
            .unwrap();
        assert_eq!(file.size, 5);

        let mut buf = Vec::new();
        file.open().await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"COVER");
    }

    #[test]
    fn from_bytes_sets_size() {
        let file = OutgoingFile::from_bytes("note.txt", b"abc".to_vec()).with_thumbnail("data:,");
        assert_eq!(file.size, 3);
        assert_eq!(file.thumbnail.as_deref(), Some("data:,"));
    }
}
