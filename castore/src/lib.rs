mod digests;
mod errors;
mod model;

pub mod backingstore;
pub mod context;
pub mod fixtures;
pub mod localstore;
pub mod objectstore;
pub mod path;

pub use digests::{ObjectId, OBJECT_ID_LEN};
pub use errors::{Error, FetchError};
pub use model::{Blob, BlobMetadata, EntryKind, ObjectKind, Tree, TreeEntry};
