//! Object-store abstraction: stream-put, stream-get, reachability probe.

mod filesystem;
mod s3;
mod traits;

pub use filesystem::FilesystemObjectStore;
pub use s3::S3ObjectStore;
pub use traits::{BodyStream, ObjectStore, PutResult, StorageError};
