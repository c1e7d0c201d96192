//! Phase 4: checkpoint tables C1/C2/C3.
//!
//! One streaming pass over final table 7: every `K_CHECKPOINT1_INTERVAL`
//! entries contribute a C1 sample and close a C3 block (the delta-coded
//! f7 values of the finished group); every `K_CHECKPOINT2_INTERVAL` C1
//! samples contribute a C2 sample. The header pointer slots are patched
//! once everything is in place.

use crate::bits::{cdiv, slice_u64, BitWriter};
use crate::constants::*;
use crate::disk::{read_exact_from, FileDisk};
use crate::encoding;
use crate::entry_sizes;
use crate::header;
use crate::Result;

pub fn run_phase4(
    k: u32,
    tmp2: &mut FileDisk,
    pointers: &mut [u64; 11],
    n7: u64,
    header_size: u32,
) -> Result<u64> {
    let interval = K_CHECKPOINT1_INTERVAL as u64;
    let c1_entry = entry_sizes::c1_entry_size(k) as u64;
    let c3_block = entry_sizes::c3_size(k) as u64;

    let group_count = cdiv(n7, interval);
    pointers[9] = pointers[8] + group_count * c1_entry;
    let c2_count = cdiv(group_count, K_CHECKPOINT2_INTERVAL as u64);
    pointers[10] = pointers[9] + c2_count * c1_entry;
    let final_size = pointers[10] + group_count * c3_block;

    log::info!("Writing C1/C2/C3 checkpoint tables ({group_count} groups)");

    let entry_size = entry_sizes::p7_entry_size(k) as usize;
    let mut reader = tmp2.sequential_reader(pointers[7])?;
    let mut entry = vec![0u8; entry_size];
    let mut c1_values: Vec<u64> = Vec::with_capacity(group_count as usize);
    let mut group: Vec<u64> = Vec::with_capacity(interval as usize);
    let mut group_index = 0u64;

    for i in 0..n7 {
        read_exact_from(&mut reader, &mut entry)?;
        let f7 = slice_u64(&entry, 0, k);
        if i % interval == 0 {
            if !group.is_empty() {
                let block = encoding::encode_c3(k, &group)?;
                tmp2.write(pointers[10] + group_index * c3_block, &block)?;
                group_index += 1;
                group.clear();
            }
            c1_values.push(f7);
        }
        group.push(f7);
    }
    if !group.is_empty() {
        let block = encoding::encode_c3(k, &group)?;
        tmp2.write(pointers[10] + group_index * c3_block, &block)?;
    }

    let mut writer = BitWriter::new();
    for (i, &value) in c1_values.iter().enumerate() {
        writer.clear();
        writer.push(value as u128, k);
        tmp2.write(pointers[8] + i as u64 * c1_entry, writer.as_bytes())?;
    }
    for (c2_index, i) in (0..c1_values.len())
        .step_by(K_CHECKPOINT2_INTERVAL as usize)
        .enumerate()
    {
        writer.clear();
        writer.push(c1_values[i] as u128, k);
        tmp2.write(pointers[9] + c2_index as u64 * c1_entry, writer.as_bytes())?;
    }

    header::patch_pointers(tmp2, header_size, pointers)?;
    tmp2.sync()?;
    Ok(final_size)
}
