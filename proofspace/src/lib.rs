//! Proof-of-space plot engine.
//!
//! An offline, disk-backed pipeline that expands a 32-byte seed into a
//! plot file of seven interlinked tables, plus the prover and verifier
//! that define the file's semantic contract. Python bindings are available
//! behind the `python` feature.

pub mod bitfield;
pub mod bits;
pub mod cache;
pub mod chacha8;
pub mod constants;
pub mod disk;
pub mod encoding;
pub mod entry_sizes;
pub mod f_calc;
pub mod header;
pub mod phases;
pub mod plotter;
pub mod prover;
#[cfg(feature = "python")]
pub mod python;
pub mod sort_manager;
pub mod verifier;

// Re-export main types
pub use plotter::{DiskPlotter, PlotParams};
pub use prover::DiskProver;
pub use verifier::validate_proof;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module entry point
#[cfg(feature = "python")]
#[pymodule]
fn proofspace(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::DiskPlotter>()?;
    m.add_class::<python::DiskProver>()?;
    m.add_class::<python::Verifier>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}

/// Plot engine error type
#[derive(Debug, thiserror::Error)]
pub enum PosError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CPU unsupported: {0}")]
    CpuUnsupported(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("No proof of space found for this challenge")]
    NoProof,

    #[error("Invalid proof")]
    InvalidProof,
}

pub type Result<T> = std::result::Result<T, PosError>;
