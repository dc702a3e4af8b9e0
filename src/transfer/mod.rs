pub mod limiter;
pub mod manager;
pub mod metadata;
pub mod download;
pub mod upload;

pub use limiter::{ConcurrencyLimiter, ConcurrencySlot};
pub use manager::{TransferError, TransferManager, TransferResult};
pub use metadata::BlobMetadataService;
pub use download::{BlobDownloadDescriptor, BlobStream, ContentProvider, DownloadDescriptor, DownloadDescriptorRef, DownloadResult, LayerDownloadManager, ReleaseHandle};
pub use upload::{BlobPusher, LayerUploadDescriptor, LayerUploadManager, UploadDescriptor, UploadDescriptorRef};
