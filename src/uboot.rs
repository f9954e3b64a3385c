//! U-Boot environment block codec.
//!
//! Serialized form: 4-byte little-endian CRC32 over the rest of the block,
//! then a NUL-separated, NUL-terminated `name=value` list, padded out with
//! 0xFF. Variables are emitted in sorted order so that identical
//! environments serialize identically.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::UBootEnvSpec;
use crate::error::{FwForgeError, Result};
use crate::sparse::BLOCK_SIZE;

pub struct UBootEnv {
    pub block_offset: u64,
    pub env_size: usize,
    vars: BTreeMap<String, String>,
}

impl UBootEnv {
    pub fn from_spec(spec: &UBootEnvSpec) -> Result<Self> {
        let env_size = (spec.block_count * BLOCK_SIZE) as usize;
        if env_size <= 8 {
            return Err(FwForgeError::config(format!(
                "uboot-environment '{}' is too small ({env_size} bytes)",
                spec.name
            )));
        }
        Ok(UBootEnv {
            block_offset: spec.block_offset,
            env_size,
            vars: BTreeMap::new(),
        })
    }

    pub fn setenv(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn unsetenv(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Parse a serialized environment, replacing the variable table.
    ///
    /// CRC mismatch or malformed records report the environment as corrupt;
    /// only `uboot_recover` tolerates that.
    pub fn read(&mut self, buffer: &[u8]) -> Result<()> {
        if buffer.len() != self.env_size {
            return Err(FwForgeError::format(format!(
                "U-Boot environment buffer is {} bytes, expected {}",
                buffer.len(),
                self.env_size
            )));
        }

        let stored_crc = LittleEndian::read_u32(&buffer[0..4]);
        let actual_crc = crc32fast::hash(&buffer[4..]);
        if stored_crc != actual_crc {
            return Err(FwForgeError::format(format!(
                "corrupt U-Boot environment: CRC32 mismatch (stored {stored_crc:#010x}, computed {actual_crc:#010x})"
            )));
        }

        let mut vars = BTreeMap::new();
        let mut pos = 4usize;
        loop {
            let rest = &buffer[pos..];
            let end = match rest.iter().position(|&b| b == 0) {
                Some(end) => end,
                None => {
                    return Err(FwForgeError::format(
                        "corrupt U-Boot environment: unterminated record",
                    ))
                }
            };
            if end == 0 {
                break; // empty record ends the list
            }
            let record = &rest[..end];
            let eq = record.iter().position(|&b| b == b'=').ok_or_else(|| {
                FwForgeError::format("corrupt U-Boot environment: record without '='")
            })?;
            let name = String::from_utf8_lossy(&record[..eq]).into_owned();
            let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
            vars.insert(name, value);
            pos += end + 1;
        }

        self.vars = vars;
        Ok(())
    }

    /// Serialize into `buffer`, which must be exactly `env_size` bytes.
    pub fn write(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() != self.env_size {
            return Err(FwForgeError::format(format!(
                "U-Boot environment buffer is {} bytes, expected {}",
                buffer.len(),
                self.env_size
            )));
        }

        buffer.fill(0xFF);
        let mut pos = 4usize;
        for (name, value) in &self.vars {
            let record_len = name.len() + 1 + value.len() + 1;
            // Leave room for the terminating empty record.
            if pos + record_len + 1 > self.env_size {
                return Err(FwForgeError::format(format!(
                    "U-Boot environment too small for its variables ({} bytes)",
                    self.env_size
                )));
            }
            buffer[pos..pos + name.len()].copy_from_slice(name.as_bytes());
            pos += name.len();
            buffer[pos] = b'=';
            pos += 1;
            buffer[pos..pos + value.len()].copy_from_slice(value.as_bytes());
            pos += value.len();
            buffer[pos] = 0;
            pos += 1;
        }
        buffer[pos] = 0;

        let crc = crc32fast::hash(&buffer[4..]);
        LittleEndian::write_u32(&mut buffer[0..4], crc);
        Ok(())
    }
}
