//! Error type shared by every layer of the HFS engine

use thiserror::Error;

/// Errors that can occur while mounting or operating on an HFS volume
#[derive(Debug, Error)]
pub enum HfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid HFS volume: {0}")]
    InvalidFormat(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("B-tree key not found: {0}")]
    KeyNotFound(String),

    #[error("Duplicate B-tree key: {0}")]
    DuplicateKey(String),

    #[error("Out of space: no free run of {requested} allocation blocks")]
    OutOfSpace { requested: u32 },

    #[error("No extent covers block {block} of file {file_id}")]
    ExtentNotFound { file_id: u32, block: u32 },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Corrupt B-tree node {node}: {detail}")]
    Corruption { node: u32, detail: String },
}

impl HfsError {
    /// Faults that indicate on-disk inconsistency rather than a caller mistake
    pub fn is_consistency_fault(&self) -> bool {
        matches!(
            self,
            HfsError::KeyNotFound(_)
                | HfsError::DuplicateKey(_)
                | HfsError::ExtentNotFound { .. }
                | HfsError::Corruption { .. }
        )
    }

    pub(crate) fn corrupt(node: u32, detail: impl Into<String>) -> Self {
        HfsError::Corruption {
            node,
            detail: detail.into(),
        }
    }
}

pub type Result<T, E = HfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_faults() {
        assert!(HfsError::KeyNotFound("k".into()).is_consistency_fault());
        assert!(HfsError::corrupt(3, "bad offsets").is_consistency_fault());
        assert!(!HfsError::PathNotFound("/a".into()).is_consistency_fault());
        assert!(!HfsError::OutOfSpace { requested: 4 }.is_consistency_fault());
    }

    #[test]
    fn test_io_conversion() {
        let err: HfsError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short").into();
        assert!(matches!(err, HfsError::Io(_)));
        assert!(err.to_string().starts_with("IO error"));
    }
}
