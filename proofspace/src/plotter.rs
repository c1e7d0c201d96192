//! Plot creation: parameter validation, resource budgeting and the
//! four-phase pipeline, ending in an atomic rename of the finished file.
//!
//! Temp layout per plot (all under the temp dirs, all deleted on success):
//! `<name>.sort.tmp`, `<name>.tableN.tmp` for N in 1..=7, the per-phase
//! `.sort_bucket_NNN.tmp` spill files, and `<name>.2.tmp` for the final
//! file until it is renamed into place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::bitfield::have_popcnt;
use crate::constants::*;
use crate::disk::FileDisk;
use crate::entry_sizes;
use crate::header;
use crate::phases::phase1::{run_phase1, Phase1Params};
use crate::phases::phase2::{run_phase2, Phase2Params};
use crate::phases::phase3::{run_phase3, Phase3Params};
use crate::phases::phase4::run_phase4;
use crate::{PosError, Result};

#[derive(Debug, Clone)]
pub struct PlotParams {
    pub tmp_dir: PathBuf,
    pub tmp2_dir: PathBuf,
    pub final_dir: PathBuf,
    pub filename: String,
    pub k: u32,
    pub memo: Vec<u8>,
    pub id: [u8; K_ID_LEN],
    /// RAM budget in MiB; 0 selects the default.
    pub buffer_mib: u32,
    /// Sort bucket count; 0 derives it from the RAM budget.
    pub num_buckets: u32,
    /// Phase-1 stripe depth; 0 selects the default.
    pub stripe_size: u64,
    /// Worker threads; 0 selects the default.
    pub num_threads: u8,
    /// The bitfield backpropagation path (the only one this build ships).
    pub bitfield: bool,
    /// `None` retries the final rename forever, five minutes apart.
    pub rename_retries: Option<u32>,
}

impl PlotParams {
    pub fn new(
        tmp_dir: impl Into<PathBuf>,
        tmp2_dir: impl Into<PathBuf>,
        final_dir: impl Into<PathBuf>,
        filename: impl Into<String>,
        k: u32,
        memo: Vec<u8>,
        id: [u8; K_ID_LEN],
    ) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            tmp2_dir: tmp2_dir.into(),
            final_dir: final_dir.into(),
            filename: filename.into(),
            k,
            memo,
            id,
            buffer_mib: 0,
            num_buckets: 0,
            stripe_size: 0,
            num_threads: 0,
            bitfield: true,
            rename_retries: None,
        }
    }
}

#[derive(Default)]
pub struct DiskPlotter;

impl DiskPlotter {
    pub fn new() -> Self {
        Self
    }

    /// Creates a plot, returning the final file path.
    pub fn create_plot_disk(&self, params: &PlotParams) -> Result<PathBuf> {
        raise_file_limit();
        let k = params.k;
        if !(K_MIN_PLOT_SIZE..=K_MAX_PLOT_SIZE).contains(&k) {
            return Err(PosError::InvalidValue(format!(
                "Plot size k = {k} is invalid"
            )));
        }

        let stripe_size = if params.stripe_size != 0 {
            params.stripe_size
        } else {
            K_DEFAULT_STRIPE_SIZE
        };
        let num_threads = if params.num_threads != 0 {
            params.num_threads
        } else {
            K_DEFAULT_THREADS
        };
        let buf_mib = if params.buffer_mib != 0 {
            params.buffer_mib
        } else {
            K_DEFAULT_BUFFER_MIB
        };
        if buf_mib < 10 {
            return Err(PosError::InsufficientMemory(
                "Please provide at least 10 MiB of RAM".into(),
            ));
        }
        if !params.bitfield {
            return Err(PosError::InvalidValue(
                "this build only supports bitfield backpropagation; \
                 drop the nobitfield flag"
                    .into(),
            ));
        }
        if !have_popcnt() {
            return Err(PosError::CpuUnsupported(
                "bitfield plotting requires the POPCNT instruction".into(),
            ));
        }

        // Account for per-thread stripe buffers and general scratch before
        // handing the rest to the sort arena.
        let thread_memory_mib = num_threads as u64
            * (2 * (stripe_size + 5000))
            * entry_sizes::max_entry_size(k, 4, true) as u64
            / (1024 * 1024);
        let sub_mib = 5 + (buf_mib as f64 * 0.05).min(50.0) as u64 + thread_memory_mib;
        if sub_mib > buf_mib as u64 {
            return Err(PosError::InsufficientMemory(format!(
                "Please provide more memory. At least {sub_mib} MiB"
            )));
        }
        let memory_size = (buf_mib as u64 - sub_mib) * 1024 * 1024;

        let mut max_table_size = 0f64;
        for table in 1..=7 {
            let size = 1.3 * (1u64 << k) as f64 * entry_sizes::max_entry_size(k, table, true) as f64;
            max_table_size = max_table_size.max(size);
        }

        let num_buckets = if params.num_buckets != 0 {
            let rounded = round_pow2(params.num_buckets);
            if rounded < K_MIN_BUCKETS {
                return Err(PosError::InvalidValue(format!(
                    "Minimum buckets is {K_MIN_BUCKETS}"
                )));
            }
            if rounded > K_MAX_BUCKETS {
                return Err(PosError::InvalidValue(format!(
                    "Maximum buckets is {K_MAX_BUCKETS}"
                )));
            }
            rounded
        } else {
            let needed =
                (max_table_size / (memory_size as f64 * K_MEM_SORT_PROPORTION)).ceil() as u32;
            let computed = 2 * round_pow2(needed.max(1));
            if computed > K_MAX_BUCKETS {
                let required_mib = (max_table_size / K_MAX_BUCKETS as f64
                    / K_MEM_SORT_PROPORTION
                    / (1024.0 * 1024.0)) as u64
                    + sub_mib;
                return Err(PosError::InsufficientMemory(format!(
                    "Do not have enough memory. Need {required_mib} MiB"
                )));
            }
            computed.max(K_MIN_BUCKETS)
        };
        let log_num_buckets = num_buckets.trailing_zeros();
        debug_assert!(num_buckets.is_power_of_two());

        if max_table_size / (num_buckets as f64) < stripe_size as f64 * 30.0 {
            return Err(PosError::InvalidValue("Stripe size too large".into()));
        }

        for (dir, what) in [
            (&params.tmp_dir, "Temp"),
            (&params.tmp2_dir, "Second temp"),
            (&params.final_dir, "Final"),
        ] {
            if !dir.is_dir() {
                return Err(PosError::InvalidValue(format!(
                    "{what} directory {} does not exist",
                    dir.display()
                )));
            }
        }

        log::info!(
            "Starting plotting progress into temporary dirs: {} and {}",
            params.tmp_dir.display(),
            params.tmp2_dir.display()
        );
        log::info!("ID: {}", hex::encode(params.id));
        log::info!("Plot size is: {k}");
        log::info!("Buffer size is: {buf_mib} MiB");
        log::info!("Using {num_buckets} buckets");
        log::info!("Using {num_threads} threads of stripe size {stripe_size}");

        let filename = &params.filename;
        let mut tmp_1_paths = vec![params.tmp_dir.join(format!("{filename}.sort.tmp"))];
        for table in 1..=7 {
            tmp_1_paths.push(params.tmp_dir.join(format!("{filename}.table{table}.tmp")));
        }
        let tmp_2_path = params.tmp2_dir.join(format!("{filename}.2.tmp"));
        let final_2_path = params.final_dir.join(format!("{filename}.2.tmp"));
        let final_path = params.final_dir.join(filename);

        for path in &tmp_1_paths {
            let _ = fs::remove_file(path);
        }
        let _ = fs::remove_file(&tmp_2_path);
        let _ = fs::remove_file(&final_path);

        let plot_result = (|| -> Result<()> {
            let mut tmp_1_disks = tmp_1_paths
                .iter()
                .map(|p| FileDisk::create(p))
                .collect::<Result<Vec<_>>>()?;
            let mut tmp2_disk = FileDisk::create(&tmp_2_path)?;
            let sort_memory = (memory_size as f64 * K_MEM_SORT_PROPORTION) as u64;

            log::info!("Starting phase 1/4: Forward Propagation into tmp files...");
            let timer = Instant::now();
            let table_sizes = run_phase1(
                &Phase1Params {
                    k,
                    id: &params.id,
                    tmp_dir: &params.tmp_dir,
                    filename,
                    sort_memory,
                    log_num_buckets,
                    stripe_size,
                    num_threads,
                },
                &mut tmp_1_disks,
            )?;
            log::info!("Time for phase 1 = {:.3} s", timer.elapsed().as_secs_f64());

            log::info!("Starting phase 2/4: Backpropagation into tmp files...");
            let timer = Instant::now();
            let p2 = run_phase2(
                &Phase2Params {
                    k,
                    tmp_dir: &params.tmp_dir,
                    filename,
                    sort_memory,
                    log_num_buckets,
                },
                &mut tmp_1_disks,
                &table_sizes,
            )?;
            log::info!("Time for phase 2 = {:.3} s", timer.elapsed().as_secs_f64());

            let header_size = header::write_header(&mut tmp2_disk, k, &params.id, &params.memo)?;

            log::info!(
                "Starting phase 3/4: Compression from tmp files into {}...",
                tmp_2_path.display()
            );
            let timer = Instant::now();
            let table1_count = table_sizes[1];
            let p3 = run_phase3(
                &Phase3Params {
                    k,
                    tmp_dir: &params.tmp_dir,
                    filename,
                    sort_memory,
                    log_num_buckets,
                    header_size,
                },
                &mut tmp2_disk,
                p2,
                &mut tmp_1_disks[1],
                table1_count,
            )?;
            log::info!("Time for phase 3 = {:.3} s", timer.elapsed().as_secs_f64());

            log::info!(
                "Starting phase 4/4: Write Checkpoint tables into {}...",
                tmp_2_path.display()
            );
            let timer = Instant::now();
            let mut pointers = p3.final_pointers;
            let final_size = run_phase4(k, &mut tmp2_disk, &mut pointers, p3.n7, header_size)?;
            log::info!("Time for phase 4 = {:.3} s", timer.elapsed().as_secs_f64());

            let mut working_space = 0u64;
            for table in 1..=7 {
                working_space +=
                    table_sizes[table] * entry_sizes::max_entry_size(k, table as u32, true) as u64;
            }
            log::info!(
                "Approximate working space used (without final file): {:.3} GiB",
                working_space as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            log::info!(
                "Final file size: {:.3} GiB",
                final_size as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            Ok(())
        })();

        // Tmp table files go away whether or not plotting succeeded.
        for path in &tmp_1_paths {
            let _ = fs::remove_file(path);
        }
        plot_result?;

        self.finalize(&tmp_2_path, &final_2_path, &final_path, params)?;
        Ok(final_path)
    }

    /// Moves the finished `.2.tmp` into place. Filesystem errors (antivirus
    /// holding the file, remote mounts flaking) are retried every five
    /// minutes, by default forever.
    fn finalize(
        &self,
        tmp_2_path: &Path,
        final_2_path: &Path,
        final_path: &Path,
        params: &PlotParams,
    ) -> Result<()> {
        let same_dir = params.tmp2_dir == params.final_dir;
        let mut copied = false;
        let mut attempts = 0u32;
        loop {
            let step: std::io::Result<()> = if same_dir {
                fs::rename(tmp_2_path, final_path)
            } else {
                (|| {
                    if !copied {
                        fs::copy(tmp_2_path, final_2_path)?;
                        copied = true;
                        let _ = fs::remove_file(tmp_2_path);
                    }
                    fs::rename(final_2_path, final_path)
                })()
            };
            match step {
                Ok(()) => {
                    log::info!("Renamed final file to {}", final_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if let Some(limit) = params.rename_retries {
                        if attempts >= limit {
                            return Err(PosError::Io(e));
                        }
                    }
                    attempts += 1;
                    log::warn!(
                        "Could not move plot to {}: {e}. Retrying in five minutes.",
                        final_path.display()
                    );
                    std::thread::sleep(std::time::Duration::from_secs(5 * 60));
                }
            }
        }
    }
}

/// Rounds up to the next power of two.
fn round_pow2(n: u32) -> u32 {
    n.next_power_of_two()
}

/// Plotting keeps up to `num_buckets * 8` temp files open; lift the soft
/// descriptor limit so defaults on conservative systems do not bite.
#[cfg(unix)]
fn raise_file_limit() {
    unsafe {
        let limit = libc::rlimit {
            rlim_cur: 600,
            rlim_max: 600,
        };
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            log::warn!("setrlimit failed; continuing with the default file limit");
        }
    }
}

#[cfg(not(unix))]
fn raise_file_limit() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::slice_u64;
    use crate::encoding;
    use crate::prover::DiskProver;
    use crate::verifier::validate_proof;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn test_params(dir: &Path, filename: &str, k: u32, id: [u8; 32], memo: Vec<u8>) -> PlotParams {
        let mut params = PlotParams::new(dir, dir, dir, filename, k, memo, id);
        params.buffer_mib = 128;
        params.num_buckets = 16;
        params.stripe_size = 8192;
        params.num_threads = 2;
        params.rename_retries = Some(0);
        params
    }

    fn hashed_challenge(num: u32, id: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(num.to_be_bytes());
        hasher.update(id);
        hasher.finalize().into()
    }

    #[test]
    fn test_plot_prove_verify_k18() {
        let dir = tempdir().unwrap();
        let id: [u8; 32] = core::array::from_fn(|i| (i * 7 + 1) as u8);
        let memo = vec![0xCA, 0xFE];
        let params = test_params(dir.path(), "plot-test-k18.dat", 18, id, memo.clone());
        let final_path = DiskPlotter::new().create_plot_disk(&params).unwrap();

        // every temp file is gone on success
        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().into_string().unwrap();
            assert!(!name.ends_with(".tmp"), "leftover temp file {name}");
        }

        let bytes = fs::read(&final_path).unwrap();
        assert_eq!(&bytes[..19], b"Proof of Space Plot");
        assert_eq!(&bytes[19..51], &id);
        assert_eq!(bytes[51], 18);

        let prover = DiskProver::new(&final_path).unwrap();
        assert_eq!(prover.size(), 18);
        assert_eq!(prover.id(), &id);
        assert_eq!(prover.memo(), &memo[..]);

        // table pointers delimit strictly increasing in-bounds regions
        let mut disk = FileDisk::open_read_only(&final_path).unwrap();
        let h = header::parse_header(&mut disk).unwrap();
        for t in 1..10 {
            assert!(h.table_begin[t] < h.table_begin[t + 1], "pointer {t}");
        }
        assert!(h.table_begin[10] < bytes.len() as u64);

        // park random access: strides divide the region, anchors ascend
        let k = 18u32;
        for table in 1..=6u32 {
            let park_size = entry_sizes::park_size(k, table) as usize;
            let region =
                &bytes[h.table_begin[table as usize] as usize..h.table_begin[table as usize + 1] as usize];
            assert_eq!(region.len() % park_size, 0, "table {table} stride");
            let parks = region.len() / park_size;
            let mut prev = None;
            for p in 0..parks.min(8) {
                let park = &region[p * park_size..(p + 1) * park_size];
                let anchor = encoding::decode_park_entry(k, table, park, 0).unwrap();
                if let Some(prev) = prev {
                    assert!(anchor >= prev, "table {table} park {p} anchor regressed");
                }
                prev = Some(anchor);
            }
        }

        // final table 7 f7 values are sorted and C1 samples them
        let e7 = entry_sizes::p7_entry_size(k) as usize;
        let t7 = &bytes[h.table_begin[7] as usize..h.table_begin[8] as usize];
        let mut prev_f7 = 0u64;
        for (i, entry) in t7.chunks_exact(e7).enumerate() {
            let f7 = slice_u64(entry, 0, k);
            assert!(f7 >= prev_f7, "table 7 entry {i} out of order");
            prev_f7 = f7;
        }
        let c1 = &bytes[h.table_begin[8] as usize..h.table_begin[9] as usize];
        let first_c1 = slice_u64(&c1[..entry_sizes::c1_entry_size(k) as usize], 0, k);
        assert_eq!(first_c1, slice_u64(&t7[..e7], 0, k));

        // prove then verify a batch of hashed challenges; every reported
        // quality must round-trip through the verifier
        let mut proofs_checked = 0u32;
        for num in 0..60u32 {
            let challenge = hashed_challenge(num, &id);
            let qualities = prover.get_qualities_for_challenge(&challenge).unwrap();
            for (index, quality) in qualities.iter().enumerate() {
                let proof = prover.get_full_proof(&challenge, index).unwrap();
                assert_eq!(proof.len(), 8 * 18);
                let verified =
                    validate_proof(&id, 18, &challenge, &proof).expect("proof must verify");
                assert_eq!(&verified, quality);
                proofs_checked += 1;
            }
        }
        assert!(proofs_checked > 10, "only {proofs_checked} proofs found");

        // tampering must invalidate proofs without aborting any call
        let mut tampered_bytes = bytes.clone();
        for table in 1..=6u32 {
            let park_size = entry_sizes::park_size(k, table) as usize;
            let mut at = h.table_begin[table as usize] as usize + 2;
            while at < h.table_begin[table as usize + 1] as usize {
                tampered_bytes[at] ^= 0x40;
                at += park_size;
            }
        }
        let tampered_path = dir.path().join("tampered.dat");
        fs::write(&tampered_path, &tampered_bytes).unwrap();
        let tampered = DiskProver::new(&tampered_path).unwrap();
        let mut invalidated = 0u32;
        for num in 0..30u32 {
            let challenge = hashed_challenge(num, &id);
            let qualities = match tampered.get_qualities_for_challenge(&challenge) {
                Ok(q) => q,
                Err(_) => {
                    invalidated += 1;
                    continue;
                }
            };
            for (index, quality) in qualities.iter().enumerate() {
                match tampered.get_full_proof(&challenge, index) {
                    Err(_) => invalidated += 1,
                    Ok(proof) => match validate_proof(&id, 18, &challenge, &proof) {
                        None => invalidated += 1,
                        Some(v) if &v != quality => invalidated += 1,
                        Some(_) => {}
                    },
                }
            }
        }
        assert!(invalidated > 0, "tampering went unnoticed");
    }

    #[test]
    fn test_deterministic_plots_k18() {
        // Same seed, same platform: byte-identical plots.
        let id = [0u8; 32];
        let mut hashes = Vec::new();
        for run in 0..2 {
            let dir = tempdir().unwrap();
            let params = test_params(dir.path(), "plot-det.dat", 18, id, Vec::new());
            let path = DiskPlotter::new().create_plot_disk(&params).unwrap();
            let bytes = fs::read(&path).unwrap();
            let digest: [u8; 32] = Sha256::digest(&bytes).into();
            hashes.push(digest);
            log::info!("run {run}: {} bytes", bytes.len());
        }
        assert_eq!(hashes[0], hashes[1]);
    }

    #[test]
    fn test_small_buffer_rejected_without_writes() {
        let dir = tempdir().unwrap();
        let id = [7u8; 32];
        let mut params = test_params(dir.path(), "plot-small.dat", 18, id, Vec::new());
        params.buffer_mib = 5;
        let err = DiskPlotter::new().create_plot_disk(&params).unwrap_err();
        assert!(matches!(err, PosError::InsufficientMemory(_)), "{err}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_k_rejected() {
        let dir = tempdir().unwrap();
        let id = [7u8; 32];
        for k in [17u32, 51] {
            let params = test_params(dir.path(), "plot-bad-k.dat", k, id, Vec::new());
            let err = DiskPlotter::new().create_plot_disk(&params).unwrap_err();
            assert!(matches!(err, PosError::InvalidValue(_)), "k={k}: {err}");
        }
    }

    #[test]
    fn test_nobitfield_rejected() {
        let dir = tempdir().unwrap();
        let id = [7u8; 32];
        let mut params = test_params(dir.path(), "plot-nobf.dat", 18, id, Vec::new());
        params.bitfield = false;
        let err = DiskPlotter::new().create_plot_disk(&params).unwrap_err();
        assert!(matches!(err, PosError::InvalidValue(_)), "{err}");
    }

    #[test]
    fn test_missing_temp_dir_rejected() {
        let dir = tempdir().unwrap();
        let id = [7u8; 32];
        let mut params = test_params(dir.path(), "plot-dir.dat", 18, id, Vec::new());
        params.tmp_dir = dir.path().join("does-not-exist");
        let err = DiskPlotter::new().create_plot_disk(&params).unwrap_err();
        assert!(matches!(err, PosError::InvalidValue(_)), "{err}");
    }
}
