//! Collaborator traits injected into the scheduling core.

pub mod storage;
pub mod writer;

pub use storage::Storage;
pub use writer::Writer;
