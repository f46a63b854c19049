use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a remote-supplied relative path stays inside the
/// download directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(relative_path: &str) -> Result<(), TransferError> {
    if relative_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(relative_path);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {relative_path}"
        )));
    }

    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {relative_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {relative_path}"
                )));
            }
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
        }
    }

    if !has_name {
        return Err(TransferError::InvalidPath(format!(
            "no file name in path: {relative_path}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_relative_path("../../../etc/passwd").is_err());
        assert!(validate_relative_path("album/../../escape").is_err());
        assert!(validate_relative_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_relative_path("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_current_dir_only() {
        assert!(validate_relative_path(".").is_err());
        assert!(validate_relative_path("./").is_err());
    }

    #[test]
    fn accepts_nested_relative_paths() {
        assert!(validate_relative_path("photo.jpg").is_ok());
        assert!(validate_relative_path("holiday/day1/photo.jpg").is_ok());
        assert!(validate_relative_path("./notes.txt").is_ok());
        assert!(validate_relative_path(".config/settings.json").is_ok());
    }
}
