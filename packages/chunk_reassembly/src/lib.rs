//! Chunk Reassembly - join chunked uploads back into a single object
//!
//! Large media files (broadcast recordings, scanned press pages) are uploaded as a
//! sequence of individually stored chunks. This crate owns the step that turns
//! those chunks back into one object:
//!
//! 1. the session is marked `processing`
//! 2. chunks are fetched one at a time, in index order, and streamed into the
//!    destination upload so peak memory stays around one chunk
//! 3. the session is marked `completed` (or `failed` with the offending index)
//! 4. the chunk objects are deleted in the background, in batches
//!
//! Status changes are compare-and-set: a session that has left `uploading` is
//! never claimed twice, and a finished session is never written again.
//!
//! The object store and session store are seams ([`ObjectStore`], [`SessionStore`]);
//! in-memory and filesystem implementations are provided.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunk_reassembly::{
//!     InMemoryObjectStore, InMemorySessionStore, ReassemblyConfig, ReassemblyRequest, Reassembler,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let objects = Arc::new(InMemoryObjectStore::new());
//!     let sessions = Arc::new(InMemorySessionStore::new());
//!     let reassembler = Reassembler::new(objects, sessions, ReassemblyConfig::default());
//!
//!     let request = ReassemblyRequest::new("session-1", "recordings/evening-news.mp4", 3);
//!     let done = reassembler.reassemble(&request).await.unwrap();
//!     println!("{} is {} bytes", done.file_name, done.file_size);
//!
//!     // Optional: wait for chunk deletion to finish
//!     let report = done.cleanup.wait().await;
//!     println!("deleted {} chunks", report.deleted);
//! }
//! ```

mod cleanup;
mod error;
mod fs_store;
mod keys;
mod reassembler;
mod session;
mod store;

pub use cleanup::{CleanupHandle, CleanupReport};
pub use error::{ReassemblyError, SessionStoreError, StoreError};
pub use fs_store::FsObjectStore;
pub use keys::{ChunkLayout, DEFAULT_CHUNK_PREFIX};
pub use reassembler::{
    DEFAULT_MAX_CHUNKS, Reassembled, ReassemblyConfig, ReassemblyRequest, Reassembler,
};
pub use session::{InMemorySessionStore, SessionStore, StatusDetail, UploadStatus};
pub use store::{ByteStream, InMemoryObjectStore, ObjectStore, UploadOptions};
