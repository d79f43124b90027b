//! Chunked transfers
//!
//! Pieces shared by the client transfer engine and the server:
//! - [`ChunkPlan`]: how content of known length is cut into requests
//! - [`UploadSource`]: seekable or spooled upload content
//! - [`TransferRecovery`]: in-process resume state
//! - [`ChunkAggregator`]: server-side part files and assembly

mod aggregate;
mod chunk;
mod recovery;
mod source;

pub use aggregate::*;
pub use chunk::*;
pub use recovery::*;
pub use source::*;
