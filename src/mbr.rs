//! Master boot record rendering.
//!
//! Builds the 512-byte MBR sector from a configuration section: optional
//! bootstrap code, disk signature, and up to four partition entries with
//! CHS fields derived from the LBA values.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{MbrPartitionSpec, MbrSpec};
use crate::error::{FwForgeError, Result};

const MBR_SIGNATURE: u16 = 0xAA55;
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const BOOTSTRAP_SIZE: usize = 440;
const DISK_SIGNATURE_OFFSET: usize = 440;

// Classic translation geometry used when synthesizing CHS addresses.
const HEADS_PER_CYLINDER: u32 = 255;
const SECTORS_PER_HEAD: u32 = 63;

/// Encode an LBA as the 3-byte CHS field of a partition entry.
///
/// Addresses beyond the 1023-cylinder limit saturate to the conventional
/// (1023, 254, 63) marker, telling firmware to use the LBA fields instead.
fn lba_to_chs(lba: u32, chs: &mut [u8]) {
    let sectors_per_cylinder = HEADS_PER_CYLINDER * SECTORS_PER_HEAD;
    let cylinder = lba / sectors_per_cylinder;
    if cylinder > 1023 {
        chs[0] = 254;
        chs[1] = 0xFF;
        chs[2] = 0xFF;
    } else {
        let head = (lba % sectors_per_cylinder) / SECTORS_PER_HEAD;
        let sector = (lba % SECTORS_PER_HEAD) + 1;
        chs[0] = head as u8;
        chs[1] = (sector as u8 & 0x3F) | ((cylinder >> 2) & 0xC0) as u8;
        chs[2] = (cylinder & 0xFF) as u8;
    }
}

fn render_partition(spec: &MbrPartitionSpec, entry: &mut [u8]) {
    entry[0] = if spec.boot { 0x80 } else { 0x00 };
    lba_to_chs(spec.block_offset, &mut entry[1..4]);
    entry[4] = spec.partition_type;
    let end_lba = spec.block_offset + spec.block_count.saturating_sub(1);
    lba_to_chs(end_lba, &mut entry[5..8]);
    LittleEndian::write_u32(&mut entry[8..12], spec.block_offset);
    LittleEndian::write_u32(&mut entry[12..16], spec.block_count);
}

/// Check the section for shape errors before anything is written.
pub fn validate(spec: &MbrSpec) -> Result<()> {
    if spec.partitions.len() > 4 {
        return Err(FwForgeError::format(format!(
            "mbr '{}' has {} partitions; the table holds at most 4",
            spec.name,
            spec.partitions.len()
        )));
    }

    if let Some(code) = &spec.bootstrap_code {
        let decoded = hex::decode(code).map_err(|_| {
            FwForgeError::format(format!("mbr '{}' bootstrap-code is not valid hex", spec.name))
        })?;
        if decoded.len() > BOOTSTRAP_SIZE {
            return Err(FwForgeError::format(format!(
                "mbr '{}' bootstrap code is {} bytes; limit is {BOOTSTRAP_SIZE}",
                spec.name,
                decoded.len()
            )));
        }
    }

    // Reject overlapping partitions; an overlap means two writers for the
    // same region.
    let mut ranges: Vec<(u64, u64)> = spec
        .partitions
        .iter()
        .filter(|p| p.block_count > 0)
        .map(|p| {
            (
                p.block_offset as u64,
                p.block_offset as u64 + p.block_count as u64,
            )
        })
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(FwForgeError::format(format!(
                "mbr '{}' has overlapping partitions (blocks {}..{} and {}..{})",
                spec.name, pair[0].0, pair[0].1, pair[1].0, pair[1].1
            )));
        }
    }

    Ok(())
}

/// Render the section into a 512-byte MBR image.
pub fn render(spec: &MbrSpec) -> Result<[u8; 512]> {
    validate(spec)?;

    let mut mbr = [0u8; 512];

    if let Some(code) = &spec.bootstrap_code {
        let decoded = hex::decode(code)
            .map_err(|_| FwForgeError::format("bootstrap-code is not valid hex"))?;
        mbr[..decoded.len()].copy_from_slice(&decoded);
    }

    if let Some(signature) = spec.signature {
        LittleEndian::write_u32(&mut mbr[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4], signature);
    }

    for (i, partition) in spec.partitions.iter().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        render_partition(partition, &mut mbr[offset..offset + PARTITION_ENTRY_SIZE]);
    }

    LittleEndian::write_u16(&mut mbr[510..512], MBR_SIGNATURE);
    Ok(mbr)
}

/// Read the starting LBA of partition `index` out of a raw MBR sector.
///
/// Used by task `require-partition-offset` predicates against the device's
/// current contents. Returns `None` for an invalid table or index.
pub fn partition_lba(mbr: &[u8; 512], index: usize) -> Option<u32> {
    if LittleEndian::read_u16(&mbr[510..512]) != MBR_SIGNATURE || index >= 4 {
        return None;
    }
    let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
    Some(LittleEndian::read_u32(&mbr[offset + 8..offset + 12]))
}
