//! Raw FAT directory-entry manipulation.
//!
//! The FAT library has no API for attribute bits or relabeling a mounted
//! volume, so these two operations patch the on-disk structures directly
//! through the block cache: parse the BPB, walk the directory tree by
//! cluster chain, and rewrite the 32-byte entry in place.

use byteorder::{ByteOrder, LittleEndian};

use crate::block::SharedCache;
use crate::error::{FwForgeError, Result};

const DIR_ENTRY_SIZE: usize = 32;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

/// Geometry of a FAT volume, parsed from its boot sector.
struct FatLayout {
    /// Absolute byte offset of the volume on the output device.
    base: u64,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u64,
    root_entry_count: u64,
    sectors_per_fat: u64,
    root_cluster: u32,
    kind: FatKind,
}

impl FatLayout {
    fn read(cache: &SharedCache, base: u64) -> Result<Self> {
        let mut bpb = [0u8; 512];
        cache.lock().unwrap().pread(&mut bpb, base)?;

        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(FwForgeError::format(format!(
                "no FAT boot sector at byte offset {base}"
            )));
        }

        let bytes_per_sector = LittleEndian::read_u16(&bpb[11..13]) as u64;
        let sectors_per_cluster = bpb[13] as u64;
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(FwForgeError::format(format!(
                "invalid FAT boot sector at byte offset {base}"
            )));
        }

        let reserved_sectors = LittleEndian::read_u16(&bpb[14..16]) as u64;
        let num_fats = bpb[16] as u64;
        let root_entry_count = LittleEndian::read_u16(&bpb[17..19]) as u64;
        let total_sectors_16 = LittleEndian::read_u16(&bpb[19..21]) as u64;
        let total_sectors_32 = LittleEndian::read_u32(&bpb[32..36]) as u64;
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };
        let sectors_per_fat_16 = LittleEndian::read_u16(&bpb[22..24]) as u64;
        let sectors_per_fat_32 = LittleEndian::read_u32(&bpb[36..40]) as u64;
        let sectors_per_fat = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16
        } else {
            sectors_per_fat_32
        };
        let root_cluster = LittleEndian::read_u32(&bpb[44..48]);

        let root_dir_sectors = (root_entry_count * DIR_ENTRY_SIZE as u64)
            .div_ceil(bytes_per_sector);
        let data_sectors = total_sectors
            .saturating_sub(reserved_sectors + num_fats * sectors_per_fat + root_dir_sectors);
        let cluster_count = data_sectors / sectors_per_cluster;
        let kind = if sectors_per_fat_16 == 0 && root_entry_count == 0 {
            FatKind::Fat32
        } else if cluster_count < 4085 {
            FatKind::Fat12
        } else {
            FatKind::Fat16
        };

        Ok(FatLayout {
            base,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entry_count,
            sectors_per_fat,
            root_cluster,
            kind,
        })
    }

    fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Absolute byte offset of a data cluster.
    fn cluster_offset(&self, cluster: u32) -> u64 {
        let root_dir_sectors = (self.root_entry_count * DIR_ENTRY_SIZE as u64)
            .div_ceil(self.bytes_per_sector);
        let data_start_sector =
            self.reserved_sectors + self.num_fats * self.sectors_per_fat + root_dir_sectors;
        self.base
            + data_start_sector * self.bytes_per_sector
            + (cluster as u64 - 2) * self.cluster_size()
    }

    /// Absolute byte range of the fixed FAT12/16 root directory.
    fn root_region(&self) -> (u64, u64) {
        let start = self.base
            + (self.reserved_sectors + self.num_fats * self.sectors_per_fat)
                * self.bytes_per_sector;
        (start, self.root_entry_count * DIR_ENTRY_SIZE as u64)
    }

    /// Read the next cluster number out of the FAT, or `None` at end of
    /// chain.
    fn next_cluster(&self, cache: &SharedCache, cluster: u32) -> Result<Option<u32>> {
        let fat_offset = self.base + self.reserved_sectors * self.bytes_per_sector;
        let mut cache = cache.lock().unwrap();
        match self.kind {
            FatKind::Fat12 => {
                let entry_offset = cluster as u64 + cluster as u64 / 2;
                let mut raw = [0u8; 2];
                cache.pread(&mut raw, fat_offset + entry_offset)?;
                let val = LittleEndian::read_u16(&raw);
                let next = if cluster & 1 == 1 { val >> 4 } else { val & 0x0FFF };
                if next < 2 || next >= 0x0FF0 {
                    Ok(None)
                } else {
                    Ok(Some(next as u32))
                }
            }
            FatKind::Fat16 => {
                let mut raw = [0u8; 2];
                cache.pread(&mut raw, fat_offset + cluster as u64 * 2)?;
                let next = LittleEndian::read_u16(&raw);
                if next < 2 || next >= 0xFFF0 {
                    Ok(None)
                } else {
                    Ok(Some(next as u32))
                }
            }
            FatKind::Fat32 => {
                let mut raw = [0u8; 4];
                cache.pread(&mut raw, fat_offset + cluster as u64 * 4)?;
                let next = LittleEndian::read_u32(&raw) & 0x0FFF_FFFF;
                if next < 2 || next >= 0x0FFF_FFF0 {
                    Ok(None)
                } else {
                    Ok(Some(next))
                }
            }
        }
    }
}

/// Where a directory's entries live.
enum DirLocation {
    /// Fixed FAT12/16 root region.
    Root,
    /// Cluster chain (FAT32 root or any subdirectory).
    Cluster(u32),
}

/// A 32-byte entry plus its absolute device offset, so it can be patched
/// in place.
struct RawEntry {
    abs_offset: u64,
    bytes: [u8; DIR_ENTRY_SIZE],
}

fn read_raw_entries(
    cache: &SharedCache,
    layout: &FatLayout,
    location: &DirLocation,
) -> Result<Vec<RawEntry>> {
    let mut regions: Vec<(u64, u64)> = Vec::new();
    match location {
        DirLocation::Root if layout.kind != FatKind::Fat32 => {
            regions.push(layout.root_region());
        }
        DirLocation::Root => {
            let mut cluster = layout.root_cluster;
            loop {
                regions.push((layout.cluster_offset(cluster), layout.cluster_size()));
                match layout.next_cluster(cache, cluster)? {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
        }
        DirLocation::Cluster(start) => {
            let mut cluster = *start;
            loop {
                regions.push((layout.cluster_offset(cluster), layout.cluster_size()));
                match layout.next_cluster(cache, cluster)? {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
        }
    }

    let mut entries = Vec::new();
    for (offset, len) in regions {
        let mut data = vec![0u8; len as usize];
        cache.lock().unwrap().pread(&mut data, offset)?;
        for (i, chunk) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let mut bytes = [0u8; DIR_ENTRY_SIZE];
            bytes.copy_from_slice(chunk);
            entries.push(RawEntry {
                abs_offset: offset + (i * DIR_ENTRY_SIZE) as u64,
                bytes,
            });
        }
    }
    Ok(entries)
}

/// Render the fixed 11-byte name field as `NAME.EXT`.
fn short_name(entry: &[u8; DIR_ENTRY_SIZE]) -> String {
    let name: String = entry[0..8]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string();
    let ext: String = entry[8..11]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string();
    if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
    }
}

/// A named directory entry after LFN reassembly.
struct NamedEntry {
    name: String,
    long_name: Option<String>,
    attr: u8,
    first_cluster: u32,
    abs_offset: u64,
}

fn parse_directory(raw: Vec<RawEntry>) -> Vec<NamedEntry> {
    let mut out = Vec::new();
    let mut lfn_parts: Vec<(u8, String)> = Vec::new();

    for entry in raw {
        let bytes = &entry.bytes;
        if bytes[0] == 0x00 {
            break;
        }
        if bytes[0] == 0xE5 {
            lfn_parts.clear();
            continue;
        }

        let attr = bytes[11];
        if attr == ATTR_LONG_NAME {
            // 13 UTF-16LE characters per LFN entry, split across three
            // fields; byte 26-27 is the (zero) cluster field, not text.
            let positions: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
            let part: String = positions
                .iter()
                .map(|&p| LittleEndian::read_u16(&bytes[p..p + 2]))
                .take_while(|&c| c != 0x0000 && c != 0xFFFF)
                .filter_map(|c| char::from_u32(c as u32))
                .collect();
            if bytes[0] & 0x40 != 0 {
                lfn_parts.clear();
            }
            lfn_parts.push((bytes[0] & 0x3F, part));
            continue;
        }

        if attr & ATTR_VOLUME_ID != 0 {
            lfn_parts.clear();
            out.push(NamedEntry {
                name: short_name(bytes),
                long_name: None,
                attr,
                first_cluster: 0,
                abs_offset: entry.abs_offset,
            });
            continue;
        }

        let long_name = if lfn_parts.is_empty() {
            None
        } else {
            lfn_parts.sort_by_key(|&(seq, _)| seq);
            let name = lfn_parts.iter().map(|(_, s)| s.as_str()).collect();
            lfn_parts.clear();
            Some(name)
        };

        let cluster_hi = LittleEndian::read_u16(&bytes[20..22]) as u32;
        let cluster_lo = LittleEndian::read_u16(&bytes[26..28]) as u32;

        out.push(NamedEntry {
            name: short_name(bytes),
            long_name,
            attr,
            first_cluster: (cluster_hi << 16) | cluster_lo,
            abs_offset: entry.abs_offset,
        });
    }
    out
}

fn name_matches(entry: &NamedEntry, component: &str) -> bool {
    if entry.name.eq_ignore_ascii_case(component) {
        return true;
    }
    entry
        .long_name
        .as_deref()
        .is_some_and(|n| n.eq_ignore_ascii_case(component))
}

/// Walk `path` from the root, returning the final component's entry.
fn find_path(cache: &SharedCache, layout: &FatLayout, path: &str) -> Result<Option<NamedEntry>> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return Ok(None);
    }

    let mut location = DirLocation::Root;
    for (i, component) in components.iter().enumerate() {
        let entries = parse_directory(read_raw_entries(cache, layout, &location)?);
        let found = entries
            .into_iter()
            .filter(|e| e.attr & ATTR_VOLUME_ID == 0)
            .find(|e| name_matches(e, component));
        match found {
            Some(entry) if i + 1 == components.len() => return Ok(Some(entry)),
            Some(entry) if entry.attr & ATTR_DIRECTORY != 0 => {
                location = DirLocation::Cluster(entry.first_cluster);
            }
            _ => return Ok(None),
        }
    }
    Ok(None)
}

/// Parse an attribute string into S/H/R bits; anything else is invalid.
pub fn parse_attributes(attributes: &str) -> Result<u8> {
    let mut bits = 0u8;
    for c in attributes.chars() {
        match c {
            'S' | 's' => bits |= ATTR_SYSTEM,
            'H' | 'h' => bits |= ATTR_HIDDEN,
            'R' | 'r' => bits |= ATTR_READ_ONLY,
            _ => {
                return Err(FwForgeError::validation(
                    "fat_attrib only supports R, H, and S attributes",
                ))
            }
        }
    }
    Ok(bits)
}

/// Replace the S/H/R attribute bits of `path`'s directory entry.
pub fn set_attributes(
    cache: &SharedCache,
    base: u64,
    path: &str,
    attributes: &str,
) -> Result<()> {
    let bits = parse_attributes(attributes)?;
    let layout = FatLayout::read(cache, base)?;
    let entry = find_path(cache, &layout, path)?.ok_or_else(|| {
        FwForgeError::resource(format!("fat_attrib: '{path}' does not exist"))
    })?;

    let attr = (entry.attr & !(ATTR_SYSTEM | ATTR_HIDDEN | ATTR_READ_ONLY)) | bits;
    cache
        .lock()
        .unwrap()
        .pwrite(&[attr], entry.abs_offset + 11, false)?;
    Ok(())
}

/// Pad/uppercase a label into the 11-byte on-disk form.
fn encode_label(label: &str) -> Result<[u8; 11]> {
    if label.len() > 11 {
        return Err(FwForgeError::validation(format!(
            "volume label '{label}' is longer than 11 characters"
        )));
    }
    let mut encoded = [b' '; 11];
    for (i, c) in label.chars().enumerate() {
        encoded[i] = c.to_ascii_uppercase() as u8;
    }
    Ok(encoded)
}

/// Set the volume label: the boot sector field plus the root directory's
/// volume-ID entry (created in a free slot when absent).
pub fn set_label(cache: &SharedCache, base: u64, label: &str) -> Result<()> {
    let encoded = encode_label(label)?;
    let layout = FatLayout::read(cache, base)?;

    // Boot sector label field.
    let bpb_offset = match layout.kind {
        FatKind::Fat32 => 71,
        _ => 43,
    };
    cache
        .lock()
        .unwrap()
        .pwrite(&encoded, base + bpb_offset, false)?;

    // Root directory volume-ID entry: rewrite the existing one, or claim a
    // free slot.
    let raw = read_raw_entries(cache, &layout, &DirLocation::Root)?;
    let mut free_slot = None;
    for entry in &raw {
        if entry.bytes[0] == 0x00 || entry.bytes[0] == 0xE5 {
            if free_slot.is_none() {
                free_slot = Some(entry.abs_offset);
            }
            if entry.bytes[0] == 0x00 {
                break;
            }
            continue;
        }
        if entry.bytes[11] != ATTR_LONG_NAME && entry.bytes[11] & ATTR_VOLUME_ID != 0 {
            cache
                .lock()
                .unwrap()
                .pwrite(&encoded, entry.abs_offset, false)?;
            return Ok(());
        }
    }

    let slot = free_slot.ok_or_else(|| {
        FwForgeError::format("fat_setlabel: root directory is full".to_string())
    })?;
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[..11].copy_from_slice(&encoded);
    entry[11] = ATTR_VOLUME_ID;
    cache.lock().unwrap().pwrite(&entry, slot, false)?;
    Ok(())
}

/// Read the volume label back out of the root directory, boot sector as a
/// fallback. Only used by tests and diagnostics.
pub fn read_label(cache: &SharedCache, base: u64) -> Result<Option<String>> {
    let layout = FatLayout::read(cache, base)?;
    for entry in read_raw_entries(cache, &layout, &DirLocation::Root)? {
        if entry.bytes[0] == 0x00 {
            break;
        }
        if entry.bytes[0] != 0xE5
            && entry.bytes[11] != ATTR_LONG_NAME
            && entry.bytes[11] & ATTR_VOLUME_ID != 0
        {
            let label: String = entry.bytes[..11].iter().map(|&b| b as char).collect();
            return Ok(Some(label.trim_end().to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cache::BlockCache;
    use crate::block::device::MemSink;
    use crate::fat::{self, FatCache};
    use std::sync::Arc;

    const VOLUME_BLOCKS: u64 = 2048; // 1 MiB

    fn formatted_volume() -> SharedCache {
        let cache = BlockCache::shared(Box::new(MemSink::new()), 4096);
        let mut fat = FatCache::new();
        fat::mkfs(&mut fat, &cache, 0, VOLUME_BLOCKS).unwrap();
        fat.close().unwrap();
        cache
    }

    #[test]
    fn test_parse_attributes() {
        assert_eq!(parse_attributes("").unwrap(), 0);
        assert_eq!(parse_attributes("S").unwrap(), ATTR_SYSTEM);
        assert_eq!(
            parse_attributes("shr").unwrap(),
            ATTR_SYSTEM | ATTR_HIDDEN | ATTR_READ_ONLY
        );
        assert!(parse_attributes("X").is_err());
        assert!(parse_attributes("R H").is_err());
    }

    #[test]
    fn test_set_attributes_round_trip() {
        let cache = formatted_volume();
        let mut fat = FatCache::new();
        fat::pwrite(&mut fat, &cache, 0, "BOOT.BIN", 0, b"contents").unwrap();
        fat.close().unwrap();

        set_attributes(&cache, 0, "BOOT.BIN", "SH").unwrap();

        let layout = FatLayout::read(&cache, 0).unwrap();
        let entry = find_path(&cache, &layout, "BOOT.BIN").unwrap().unwrap();
        assert_eq!(entry.attr & ATTR_SYSTEM, ATTR_SYSTEM);
        assert_eq!(entry.attr & ATTR_HIDDEN, ATTR_HIDDEN);
        assert_eq!(entry.attr & ATTR_READ_ONLY, 0);

        // Clearing works too.
        set_attributes(&cache, 0, "BOOT.BIN", "").unwrap();
        let entry = find_path(&cache, &layout, "BOOT.BIN").unwrap().unwrap();
        assert_eq!(entry.attr & (ATTR_SYSTEM | ATTR_HIDDEN | ATTR_READ_ONLY), 0);
    }

    #[test]
    fn test_set_attributes_missing_file() {
        let cache = formatted_volume();
        assert!(set_attributes(&cache, 0, "NOPE.TXT", "R").is_err());
    }

    #[test]
    fn test_attributes_in_subdirectory() {
        let cache = formatted_volume();
        let mut fat = FatCache::new();
        fat::mkdir(&mut fat, &cache, 0, "SYS").unwrap();
        fat::pwrite(&mut fat, &cache, 0, "SYS/CONFIG.TXT", 0, b"x").unwrap();
        fat.close().unwrap();

        set_attributes(&cache, 0, "SYS/CONFIG.TXT", "r").unwrap();

        let layout = FatLayout::read(&cache, 0).unwrap();
        let entry = find_path(&cache, &layout, "SYS/CONFIG.TXT")
            .unwrap()
            .unwrap();
        assert_eq!(entry.attr & ATTR_READ_ONLY, ATTR_READ_ONLY);
    }

    #[test]
    fn test_set_label_creates_and_updates() {
        let cache = formatted_volume();
        set_label(&cache, 0, "boot").unwrap();
        assert_eq!(read_label(&cache, 0).unwrap().as_deref(), Some("BOOT"));

        set_label(&cache, 0, "FIRMWARE").unwrap();
        assert_eq!(read_label(&cache, 0).unwrap().as_deref(), Some("FIRMWARE"));
    }

    #[test]
    fn test_label_too_long() {
        let cache = formatted_volume();
        assert!(set_label(&cache, 0, "TWELVE_CHARS").is_err());
    }

    #[test]
    fn test_long_name_match() {
        let cache = formatted_volume();
        let mut fat = FatCache::new();
        fat::pwrite(&mut fat, &cache, 0, "a-long-file-name.txt", 0, b"x").unwrap();
        fat.close().unwrap();

        set_attributes(&cache, 0, "a-long-file-name.txt", "H").unwrap();
        let layout = FatLayout::read(&cache, 0).unwrap();
        let entry = find_path(&cache, &layout, "A-Long-File-Name.TXT")
            .unwrap()
            .unwrap();
        assert_eq!(entry.attr & ATTR_HIDDEN, ATTR_HIDDEN);
    }
}
