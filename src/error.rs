//! Error types and handling for shmstore

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for the shared-memory object store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Schema description is malformed or incomplete
    #[error("Invalid schema: {message}")]
    SchemaInvalid { message: String },

    /// OS refused to open, size, or map the shared-memory segment
    #[error("Segment error: {message}")]
    SegmentOpen {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A path did not resolve to a directory node
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// The stored kind cannot be coerced to or from the requested kind
    #[error("Type mismatch at {name}: {message}")]
    TypeMismatch { name: String, message: String },

    /// OS refused a semaphore open/wait/post
    #[error("Semaphore error: {name} - {message}")]
    Semaphore { name: String, message: String },
}

impl StoreError {
    /// Create a schema validation error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaInvalid {
            message: message.into(),
        }
    }

    /// Create a segment error from a standard I/O error
    pub fn segment_io(source: std::io::Error, context: &str) -> Self {
        Self::SegmentOpen {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a segment error without an I/O source
    pub fn segment(message: impl Into<String>) -> Self {
        Self::SegmentOpen {
            message: message.into(),
            source: None,
        }
    }

    /// Create a path resolution error
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a semaphore error
    pub fn semaphore(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Semaphore {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::segment_io(err, "I/O operation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = StoreError::schema("missing type");
        assert!(matches!(err, StoreError::SchemaInvalid { .. }));

        let err = StoreError::path_not_found("a/b/c");
        assert!(matches!(err, StoreError::PathNotFound { .. }));

        let err = StoreError::semaphore("/snSem_0", "open failed");
        assert!(matches!(err, StoreError::Semaphore { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::type_mismatch("speed", "container has no scalar value");
        let display = format!("{}", err);
        assert!(display.contains("Type mismatch"));
        assert!(display.contains("speed"));
    }
}
