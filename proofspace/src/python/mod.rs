//! PyO3 bindings.
//!
//! Exposes the three opaque handles of the binding surface: `DiskPlotter`,
//! `DiskProver` and `Verifier`. All byte arguments travel as Python
//! `bytes`; the heavy calls release the GIL while they run.

use pyo3::exceptions::{PyIOError, PyMemoryError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use std::path::Path;

use crate::constants::K_ID_LEN;
use crate::plotter::PlotParams;
use crate::{PosError, Result};

fn to_py_err(err: PosError) -> PyErr {
    match err {
        PosError::InvalidValue(m) => PyValueError::new_err(m),
        PosError::InsufficientMemory(m) => PyMemoryError::new_err(m),
        PosError::Io(e) => PyIOError::new_err(e.to_string()),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn id_from_bytes(id: &[u8]) -> PyResult<[u8; K_ID_LEN]> {
    <[u8; K_ID_LEN]>::try_from(id)
        .map_err(|_| PyValueError::new_err(format!("id must be {K_ID_LEN} bytes")))
}

fn challenge_from_bytes(challenge: &[u8]) -> PyResult<[u8; 32]> {
    <[u8; 32]>::try_from(challenge)
        .map_err(|_| PyValueError::new_err("challenge must be 32 bytes"))
}

#[pyclass]
pub struct DiskPlotter;

#[pymethods]
impl DiskPlotter {
    #[new]
    fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (tmp_dir, tmp2_dir, final_dir, filename, k, memo, id,
                        buf_megabytes = 0, num_buckets = 0, stripe_size = 0,
                        num_threads = 0, nobitfield = false))]
    fn create_plot_disk(
        &self,
        py: Python<'_>,
        tmp_dir: String,
        tmp2_dir: String,
        final_dir: String,
        filename: String,
        k: u32,
        memo: Vec<u8>,
        id: Vec<u8>,
        buf_megabytes: u32,
        num_buckets: u32,
        stripe_size: u64,
        num_threads: u8,
        nobitfield: bool,
    ) -> PyResult<()> {
        let id = id_from_bytes(&id)?;
        let mut params = PlotParams::new(tmp_dir, tmp2_dir, final_dir, filename, k, memo, id);
        params.buffer_mib = buf_megabytes;
        params.num_buckets = num_buckets;
        params.stripe_size = stripe_size;
        params.num_threads = num_threads;
        params.bitfield = !nobitfield;
        py.allow_threads(|| -> Result<()> {
            crate::plotter::DiskPlotter::new().create_plot_disk(&params)?;
            Ok(())
        })
        .map_err(to_py_err)
    }
}

#[pyclass]
pub struct DiskProver {
    inner: crate::prover::DiskProver,
}

#[pymethods]
impl DiskProver {
    #[new]
    fn new(path: String) -> PyResult<Self> {
        let inner = crate::prover::DiskProver::new(Path::new(&path)).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn get_memo<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new_bound(py, self.inner.memo())
    }

    fn get_id<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new_bound(py, self.inner.id())
    }

    fn get_size(&self) -> u32 {
        self.inner.size()
    }

    fn get_filename(&self) -> String {
        self.inner.filename().display().to_string()
    }

    fn get_qualities_for_challenge<'py>(
        &self,
        py: Python<'py>,
        challenge: Vec<u8>,
    ) -> PyResult<Vec<Bound<'py, PyBytes>>> {
        let challenge = challenge_from_bytes(&challenge)?;
        let qualities = py
            .allow_threads(|| self.inner.get_qualities_for_challenge(&challenge))
            .map_err(to_py_err)?;
        Ok(qualities
            .iter()
            .map(|q| PyBytes::new_bound(py, q))
            .collect())
    }

    fn get_full_proof<'py>(
        &self,
        py: Python<'py>,
        challenge: Vec<u8>,
        index: usize,
    ) -> PyResult<Bound<'py, PyBytes>> {
        let challenge = challenge_from_bytes(&challenge)?;
        let proof = py
            .allow_threads(|| self.inner.get_full_proof(&challenge, index))
            .map_err(to_py_err)?;
        Ok(PyBytes::new_bound(py, &proof))
    }
}

#[pyclass]
pub struct Verifier;

#[pymethods]
impl Verifier {
    #[new]
    fn new() -> Self {
        Self
    }

    fn validate_proof<'py>(
        &self,
        py: Python<'py>,
        id: Vec<u8>,
        k: u32,
        challenge: Vec<u8>,
        proof: Vec<u8>,
    ) -> PyResult<Option<Bound<'py, PyBytes>>> {
        let id = id_from_bytes(&id)?;
        let challenge = challenge_from_bytes(&challenge)?;
        let quality =
            py.allow_threads(|| crate::verifier::validate_proof(&id, k, &challenge, &proof));
        Ok(quality.map(|q| PyBytes::new_bound(py, &q)))
    }
}
