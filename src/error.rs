use std::fmt::{Display, Formatter};

use crate::digest::{ChainId, DiffId, ImageId};

#[derive(Debug)]
pub enum ImageError {
    LayerNotFound { chain_id: ChainId },
    ImageNotFound { reference: String },
    ContainerNotFound { id: String },
    ReferenceNotFound { name: String },
    MountNotFound { name: String },
    MountNameConflict { name: String },
    ReferenceConflict { name: String, existing: ImageId },
    ImageHasChildren { id: ImageId },
    ImageInUse { id: ImageId, container: String },
    ImageInMultipleRepositories { id: ImageId },
    DiffIdMismatch { expected: DiffId, actual: DiffId },
    InvalidLayerCount { expected: usize, actual: usize },
    InvalidReference { message: String },
    InvalidImageConfig { message: String },
    Cancelled,
    Driver { operation: &'static str, id: String, error: std::io::Error },
    Transfer { key: String, message: String },
    Lease { id: String, message: String },
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    IO(std::io::Error),
    Other { message: String }
}

impl ImageError {
    /// Wraps a storage driver error with the operation and the ID it was working on.
    pub fn driver(operation: &'static str, id: &str, error: std::io::Error) -> ImageError {
        ImageError::Driver { operation, id: id.to_owned(), error }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ImageError::LayerNotFound { .. }
            | ImageError::ImageNotFound { .. }
            | ImageError::ContainerNotFound { .. }
            | ImageError::ReferenceNotFound { .. }
            | ImageError::MountNotFound { .. } => true,
            ImageError::Driver { error, .. } | ImageError::IO(error) => error.kind() == std::io::ErrorKind::NotFound,
            _ => false
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ImageError::MountNameConflict { .. }
            | ImageError::ReferenceConflict { .. }
            | ImageError::ImageHasChildren { .. }
            | ImageError::ImageInUse { .. }
            | ImageError::ImageInMultipleRepositories { .. } => true,
            _ => false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled)
    }
}

impl Display for ImageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::LayerNotFound { chain_id } => write!(f, "Layer does not exist: {}", chain_id),
            ImageError::ImageNotFound { reference } => write!(f, "No such image: {}", reference),
            ImageError::ContainerNotFound { id } => write!(f, "Container not found: {}", id),
            ImageError::ReferenceNotFound { name } => write!(f, "Reference does not exist: {}", name),
            ImageError::MountNotFound { name } => write!(f, "Mount does not exist: {}", name),
            ImageError::MountNameConflict { name } => write!(f, "Mount already exists with name: {}", name),
            ImageError::ReferenceConflict { name, existing } => write!(f, "Reference {} already points to {}", name, existing),
            ImageError::ImageHasChildren { id } => write!(f, "Conflict: image {} has dependent child images", id.short()),
            ImageError::ImageInUse { id, container } => write!(f, "Conflict: image {} is being used by container {}", id.short(), container),
            ImageError::ImageInMultipleRepositories { id } => write!(f, "Conflict: image {} is referenced in multiple repositories and must be forced", id.short()),
            ImageError::DiffIdMismatch { expected, actual } => write!(f, "Layer diff ID mismatch: expected {} but got {}", expected, actual),
            ImageError::InvalidLayerCount { expected, actual } => write!(f, "Invalid layer count: expected {} but got {}", expected, actual),
            ImageError::InvalidReference { message } => write!(f, "Invalid reference: {}", message),
            ImageError::InvalidImageConfig { message } => write!(f, "Invalid image config: {}", message),
            ImageError::Cancelled => write!(f, "Operation cancelled"),
            ImageError::Driver { operation, id, error } => write!(f, "Storage driver failed to {} {}: {}", operation, id, error),
            ImageError::Transfer { key, message } => write!(f, "Transfer of {} failed: {}", key, message),
            ImageError::Lease { id, message } => write!(f, "Lease {} failed: {}", id, message),
            ImageError::Database(err) => write!(f, "Database error: {}", err),
            ImageError::Serialization(err) => write!(f, "Serialization error: {}", err),
            ImageError::IO(err) => write!(f, "I/O error: {}", err),
            ImageError::Other { message } => write!(f, "{}", message)
        }
    }
}

impl std::error::Error for ImageError {}

impl From<std::io::Error> for ImageError {
    fn from(error: std::io::Error) -> Self {
        ImageError::IO(error)
    }
}

impl From<rusqlite::Error> for ImageError {
    fn from(error: rusqlite::Error) -> Self {
        ImageError::Database(error)
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(error: serde_json::Error) -> Self {
        ImageError::Serialization(error)
    }
}

pub type ImageResult<T> = Result<T, ImageError>;

/// A result that was only partially computed before `error` stopped the operation.
#[derive(Debug)]
pub struct Partial<T> {
    pub value: T,
    pub error: ImageError
}

impl<T> Partial<T> {
    pub fn new(value: T, error: ImageError) -> Partial<T> {
        Partial {
            value,
            error
        }
    }
}

impl<T> Display for Partial<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[test]
fn test_driver_error_keeps_not_found() {
    let error = ImageError::driver("remove", "abc", std::io::Error::from(std::io::ErrorKind::NotFound));
    assert!(error.is_not_found());
    assert!(!error.is_conflict());
    assert_eq!("Storage driver failed to remove abc: entity not found", error.to_string());

    let error = ImageError::driver("mount", "abc", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
    assert!(!error.is_not_found());
}

#[test]
fn test_classification() {
    assert!(ImageError::Cancelled.is_cancelled());
    assert!(ImageError::MountNameConflict { name: "c1".to_owned() }.is_conflict());
    assert!(ImageError::ContainerNotFound { id: "c1".to_owned() }.is_not_found());
}
