//! Gateway-side ingestion: frame validation, archival tee, canonical
//! envelope emission.

pub mod archive;
pub mod engine;
pub mod frame;

pub use archive::{ArchiveSink, ArchivedFrame};
pub use engine::{IngestEngine, RawFrame};
pub use frame::{FrameError, FrameFields};
