//! Driver for a decametre-band calibration and imaging pipeline.
//!
//! The heavy lifting (flagging, averaging, self-calibration, imaging) is done
//! by external tools invoked as subprocesses; this crate sequences the
//! stages, prepares the data layout, fans work out over bounded worker pools
//! and applies a quality gate between direction-dependent calibration and
//! facet imaging.

pub mod command;
pub mod config;
pub mod error;
pub mod grid;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod quality;
