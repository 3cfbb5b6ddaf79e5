//! Tub ingestion, record store, and batch generators for steering models.
//!
//! This crate provides utilities for:
//! - Discovering tubs and parsing their per-frame records
//! - Keeping parsed samples in a shared in-memory store
//! - Endless shuffled batches for single-frame and sequence models
//! - Converting legacy compressed archives into regular records

pub mod aug;
pub mod batch;
pub mod binning;
pub mod eval;
pub mod frame;
pub mod index;
pub mod legacy;
pub mod sequence;
pub mod store;
pub mod tensor;
pub mod types;

pub use aug::{Augment, ColorJitter};
pub use batch::{Batch, BatchOptions, ContinuousConfig, GenStats, Targets, TubBatchGen};
pub use binning::{BinSpec, CategoricalBins};
pub use eval::EvalFrames;
pub use frame::{load_frame, reconstruction_target, ImageGeometry, RECONSTRUCTION_SIDE};
pub use index::{
    collate_records, expand_tub_arg, gather_records, ingest_tubs, parse_sample, read_tub_list,
    record_index, IngestOptions,
};
pub use legacy::{convert_archive, extract_legacy_archives};
pub use sequence::{
    build_windows, split_windows, SequenceBatchGen, SequenceConfig, SequenceMode, Window,
};
pub use store::{RecordStore, SharedStore};
pub use tensor::HostTensor;
pub use types::*;
