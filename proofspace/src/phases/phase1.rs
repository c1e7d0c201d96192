//! Phase 1: forward propagation.
//!
//! Table 1 is the f1 evaluation of every x in `[0, 2^k)`. Each later table
//! t+1 is produced by scanning table t in sorted order, finding all matches
//! between adjacent y-buckets and evaluating `f_{t+1}` on each matched
//! pair.
//!
//! Worker threads consume stripe-sized jobs and commit their output
//! through a turnstile: a single "next stripe to commit" counter plus one
//! condition variable, so entries reach the sort manager in stripe order.
//! That counter is the only cross-thread synchronization point besides the
//! sort-manager mutex itself.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bits::{cdiv, slice_u64, BitWriter};
use crate::constants::*;
use crate::disk::FileDisk;
use crate::entry_sizes;
use crate::f_calc::{F1Calculator, FxCalculator, Metadata, PlotEntry};
use crate::sort_manager::SortManager;
use crate::{PosError, Result};

pub struct Phase1Params<'a> {
    pub k: u32,
    pub id: &'a [u8; K_ID_LEN],
    pub tmp_dir: &'a Path,
    pub filename: &'a str,
    pub sort_memory: u64,
    pub log_num_buckets: u32,
    pub stripe_size: u64,
    pub num_threads: u8,
}

/// Orders stripe commits: a worker that computed stripe `i` blocks until
/// every earlier stripe has been committed.
struct Turnstile {
    next: Mutex<u64>,
    cv: Condvar,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            next: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn wait_for(&self, stripe: u64) {
        let mut next = self.next.lock();
        while *next != stripe {
            self.cv.wait(&mut next);
        }
    }

    fn advance(&self) {
        let mut next = self.next.lock();
        *next += 1;
        drop(next);
        self.cv.notify_all();
    }
}

/// Bounded multi-producer/multi-consumer job queue.
struct JobQueue<T> {
    state: Mutex<(VecDeque<T>, bool)>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> JobQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new((VecDeque::new(), false)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, item: T) {
        let mut state = self.state.lock();
        while state.0.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        state.0.push_back(item);
        drop(state);
        self.not_empty.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.1 = true;
        drop(state);
        self.not_empty.notify_all();
    }

    fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.0.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.1 {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }
}

/// First error wins; later ones are dropped.
struct ErrorSlot(Mutex<Option<PosError>>);

impl ErrorSlot {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn set(&self, err: PosError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    fn take(&self) -> Option<PosError> {
        self.0.lock().take()
    }
}

/// One maximal run of entries sharing `y / K_BC`.
struct Group {
    bucket_id: u64,
    entries: Vec<PlotEntry>,
}

/// A stripe job: match every adjacent group pair. The last group is the
/// lookahead boundary, matched as the left side by the next job.
struct MatchJob {
    index: u64,
    groups: Vec<Group>,
}

pub fn run_phase1(params: &Phase1Params, table_files: &mut [FileDisk]) -> Result<[u64; 8]> {
    let k = params.k;
    let mut table_sizes = [0u64; 8];

    log::info!("Computing table 1");
    let mut sort = Mutex::new(SortManager::new(
        params.tmp_dir,
        &format!("{}.p1.t1", params.filename),
        entry_sizes::max_entry_size(k, 1, true) as usize,
        params.log_num_buckets,
        params.sort_memory,
    )?);
    generate_f1(params, &sort)?;
    table_sizes[1] = sort.get_mut().total_entries();

    for t in 1..=6u32 {
        log::info!("Computing table {}", t + 1);
        let next = Mutex::new(SortManager::new(
            params.tmp_dir,
            &format!("{}.p1.t{}", params.filename, t + 1),
            entry_sizes::max_entry_size(k, t + 1, true) as usize,
            params.log_num_buckets,
            params.sort_memory,
        )?);
        let stream = sort.into_inner().into_sorted_stream()?;
        let count = forward_propagate(params, t, stream, &mut table_files[t as usize], &next)?;
        table_sizes[t as usize] = count;
        if next.lock().total_entries() == 0 {
            return Err(PosError::InvariantViolation(format!(
                "table {} is empty; the seed produced no matches",
                t + 1
            )));
        }
        sort = next;
    }

    // Table 7 has no matching pass: drain it, sorted, straight to disk.
    let entry_size = entry_sizes::max_entry_size(k, 7, true) as usize;
    let mut stream = sort.into_inner().into_sorted_stream()?;
    let mut offset = 0u64;
    let mut count = 0u64;
    while let Some(entry) = stream.next_entry()? {
        table_files[7].write(offset, entry)?;
        offset += entry_size as u64;
        count += 1;
    }
    table_files[7].flush()?;
    table_sizes[7] = count;

    log::info!(
        "Phase 1 table sizes: {:?}",
        &table_sizes[1..=7]
    );
    Ok(table_sizes)
}

/// Table 1: f1 over all of `[0, 2^k)`, parallelized over x stripes.
fn generate_f1(params: &Phase1Params, sort: &Mutex<SortManager>) -> Result<()> {
    let k = params.k;
    let total: u64 = 1 << k;
    let stripes = cdiv(total, params.stripe_size);
    let entry_size = entry_sizes::max_entry_size(k, 1, true) as usize;
    let turnstile = Turnstile::new();
    let next_job = AtomicU64::new(0);
    let error = ErrorSlot::new();
    let threads = params.num_threads.max(1) as usize;

    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                let f1 = F1Calculator::new(k, params.id);
                let mut batch: Vec<(u64, u64)> = Vec::with_capacity(1 << K_BATCH_SIZES);
                let mut writer = BitWriter::new();
                loop {
                    let job = next_job.fetch_add(1, Ordering::SeqCst);
                    if job >= stripes || error.is_set() {
                        break;
                    }
                    let first_x = job * params.stripe_size;
                    let n = params.stripe_size.min(total - first_x);
                    let mut buf = Vec::with_capacity(n as usize * entry_size);
                    let mut x = first_x;
                    while x < first_x + n {
                        let chunk = (1u64 << K_BATCH_SIZES).min(first_x + n - x);
                        batch.clear();
                        f1.calculate_buckets(x, chunk, &mut batch);
                        for &(y, bx) in &batch {
                            writer.clear();
                            writer.push(y as u128, k + K_EXTRA_BITS);
                            writer.push(bx as u128, k);
                            buf.extend_from_slice(writer.as_bytes());
                        }
                        x += chunk;
                    }

                    turnstile.wait_for(job);
                    if !error.is_set() {
                        let mut sm = sort.lock();
                        for entry in buf.chunks_exact(entry_size) {
                            if let Err(e) = sm.add(entry) {
                                error.set(e);
                                break;
                            }
                        }
                    }
                    turnstile.advance();
                }
            });
        }
    });

    match error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Streams sorted table t to its tmp file while dispatching match stripes;
/// matched pairs become table t+1 entries in `next_sort`. Returns the
/// table t entry count.
fn forward_propagate(
    params: &Phase1Params,
    t: u32,
    stream: crate::sort_manager::SortedStream,
    table_file: &mut FileDisk,
    next_sort: &Mutex<SortManager>,
) -> Result<u64> {
    let threads = params.num_threads.max(1) as usize;
    let queue: JobQueue<MatchJob> = JobQueue::new(threads * 2);
    let turnstile = Turnstile::new();
    let error = ErrorSlot::new();

    let count = std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| match_worker(params, t, &queue, &turnstile, next_sort, &error));
        }
        let produced = produce_jobs(params, t, stream, table_file, &queue, &error);
        queue.close();
        produced
    })?;

    match error.take() {
        Some(e) => Err(e),
        None => Ok(count),
    }
}

/// Single-threaded reader side: writes the sorted table to disk, slices it
/// into `K_BC` groups and packages stripe jobs.
fn produce_jobs(
    params: &Phase1Params,
    t: u32,
    mut stream: crate::sort_manager::SortedStream,
    table_file: &mut FileDisk,
    queue: &JobQueue<MatchJob>,
    error: &ErrorSlot,
) -> Result<u64> {
    let k = params.k;
    let entry_size = entry_sizes::max_entry_size(k, t, true) as usize;
    let meta_bits = k * K_VECTOR_LENS[t as usize + 1];

    let mut pending: Vec<Group> = Vec::new();
    let mut pending_entries = 0usize;
    let mut job_index = 0u64;
    let mut pos = 0u64;
    let mut file_offset = 0u64;

    while let Some(entry) = stream.next_entry()? {
        if error.is_set() {
            // drain remains so spill files are still deleted
            continue;
        }
        table_file.write(file_offset, entry)?;
        file_offset += entry_size as u64;

        let y = slice_u64(entry, 0, k + K_EXTRA_BITS);
        let metadata = Metadata::from_bits(entry, (k + K_EXTRA_BITS) as u64, meta_bits);
        let bucket_id = y / K_BC;

        let start_new = match pending.last() {
            Some(g) => g.bucket_id != bucket_id,
            None => true,
        };
        if start_new {
            // Completed a group boundary: cut a stripe job once enough
            // entries have accumulated, carrying the boundary group over.
            if pending.len() >= 2 && pending_entries >= params.stripe_size as usize {
                let boundary = Group {
                    bucket_id: pending.last().unwrap().bucket_id,
                    entries: pending.last().unwrap().entries.clone(),
                };
                queue.push(MatchJob {
                    index: job_index,
                    groups: std::mem::replace(&mut pending, vec![boundary]),
                });
                job_index += 1;
                pending_entries = pending[0].entries.len();
            }
            pending.push(Group {
                bucket_id,
                entries: Vec::new(),
            });
        }
        pending.last_mut().unwrap().entries.push(PlotEntry {
            y,
            pos,
            metadata,
        });
        pending_entries += 1;
        pos += 1;
    }
    table_file.flush()?;

    if !pending.is_empty() && !error.is_set() {
        queue.push(MatchJob {
            index: job_index,
            groups: pending,
        });
    }
    Ok(pos)
}

fn match_worker(
    params: &Phase1Params,
    t: u32,
    queue: &JobQueue<MatchJob>,
    turnstile: &Turnstile,
    next_sort: &Mutex<SortManager>,
    error: &ErrorSlot,
) {
    let k = params.k;
    let out_table = t + 1;
    let out_entry_size = entry_sizes::max_entry_size(k, out_table, true) as usize;
    let mut fx = FxCalculator::new(k, out_table);
    let mut matches: Vec<(usize, usize)> = Vec::new();
    let mut writer = BitWriter::new();

    while let Some(job) = queue.pop() {
        let mut out: Vec<u8> = Vec::new();
        let mut failure: Option<PosError> = None;

        if !error.is_set() {
            for gi in 0..job.groups.len().saturating_sub(1) {
                let (left, right) = (&job.groups[gi], &job.groups[gi + 1]);
                if right.bucket_id != left.bucket_id + 1 {
                    continue;
                }
                matches.clear();
                fx.find_matches(&left.entries, &right.entries, &mut matches);
                for &(li, ri) in &matches {
                    let le = &left.entries[li];
                    let re = &right.entries[ri];
                    let offset = re.pos - le.pos;
                    if offset >= 1 << K_OFFSET_SIZE {
                        // unrepresentable in the offset field; a pair this
                        // far apart is lost rather than fatal
                        log::debug!("dropping match with offset {offset}");
                        continue;
                    }
                    let (y_new, meta_new) = fx.calculate_bucket(le.y, &le.metadata, &re.metadata);
                    writer.clear();
                    writer.push(y_new as u128, k + K_EXTRA_BITS);
                    meta_new.append_to(&mut writer);
                    writer.push(le.pos as u128, k + 1);
                    writer.push(offset as u128, K_OFFSET_SIZE);
                    debug_assert_eq!(writer.as_bytes().len(), out_entry_size);
                    out.extend_from_slice(writer.as_bytes());
                }
            }
        }

        turnstile.wait_for(job.index);
        if failure.is_none() && !error.is_set() {
            let mut sm = next_sort.lock();
            for entry in out.chunks_exact(out_entry_size) {
                if let Err(e) = sm.add(entry) {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            error.set(e);
        }
        turnstile.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_turnstile_orders_commits() {
        let turnstile = Turnstile::new();
        let order = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for stripe in (0..8u64).rev() {
                let turnstile = &turnstile;
                let order = &order;
                scope.spawn(move || {
                    turnstile.wait_for(stripe);
                    order.lock().push(stripe);
                    turnstile.advance();
                });
            }
        });
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_job_queue_close_drains() {
        let queue: JobQueue<u32> = JobQueue::new(2);
        let seen = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..3 {
                let queue = &queue;
                let seen = &seen;
                scope.spawn(move || {
                    while queue.pop().is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            for i in 0..20 {
                queue.push(i);
            }
            queue.close();
        });
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }
}
