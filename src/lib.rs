//! Firmware-image assembly and apply engine for embedded Linux devices.
//!
//! A declarative configuration describes the layout of a target storage
//! device — MBR partition tables, FAT filesystems, U-Boot environment
//! blocks, raw regions — together with named file resources. `create`
//! packs that into a content-addressed archive; `apply` runs one of the
//! archive's tasks against a device, verifying every byte against the
//! manifest's BLAKE2b-256 digests on the way through the block cache.

pub mod actions;
pub mod apply;
pub mod archive;
pub mod block;
pub mod config;
pub mod create;
pub mod error;
pub mod fat;
pub mod mbr;
pub mod progress;
pub mod resource;
pub mod sparse;
pub mod task;
pub mod uboot;

pub use error::{FwForgeError, Result};
