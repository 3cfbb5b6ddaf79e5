//! Shared data contracts for driving tubs: per-frame records and legacy archives.

pub mod archive;
pub mod record;

pub use archive::{LegacyArchive, RawImage};
pub use record::{RecordError, TubRecord};
