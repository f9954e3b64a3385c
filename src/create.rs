//! Archive creation.
//!
//! Reads a configuration document, validates every funlist, resolves the
//! host-side inputs (resource files, MBR bootstrap code), computes sparse
//! maps and BLAKE2b-256 digests, and writes the content-addressed archive:
//! the manifest first, then each resource's data bytes in declaration
//! order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use log::{debug, info};

use crate::actions::{run_funlist, FunContext, Phase};
use crate::archive::ArchiveWriter;
use crate::config::FwConfig;
use crate::error::{FwForgeError, Result};
use crate::fat::FatCache;
use crate::mbr;
use crate::progress::{Progress, Reporter};
use crate::sparse::SparseMap;

/// Validate every funlist of every task, with the context type each event
/// implies. This is where argument-shape errors surface, not at apply
/// time.
pub fn validate_config(cfg: &FwConfig) -> Result<()> {
    let mut progress = Progress::new(Reporter::sink());
    let mut fat = FatCache::new();

    for task in &cfg.tasks {
        {
            let mut fctx = FunContext::global(cfg, None, &mut progress, &mut fat, false);
            run_funlist(&mut fctx, &task.on_init, Phase::Validate).map_err(|e| {
                FwForgeError::validation(format!("task '{}' on-init: {e}", task.name))
            })?;
        }
        for on_resource in &task.on_resource {
            let mut fctx = FunContext::for_resource(
                cfg,
                None,
                &mut progress,
                &mut fat,
                false,
                on_resource.name.clone(),
                None,
            );
            run_funlist(&mut fctx, &on_resource.funlist, Phase::Validate).map_err(|e| {
                FwForgeError::validation(format!(
                    "task '{}' on-resource '{}': {e}",
                    task.name, on_resource.name
                ))
            })?;
        }
        {
            let mut fctx = FunContext::global(cfg, None, &mut progress, &mut fat, false);
            run_funlist(&mut fctx, &task.on_finish, Phase::Validate).map_err(|e| {
                FwForgeError::validation(format!("task '{}' on-finish: {e}", task.name))
            })?;
        }
    }

    for spec in &cfg.mbrs {
        mbr::validate(spec)?;
    }
    Ok(())
}

/// A resolved resource ready to be written into the archive.
struct ResolvedResource {
    name: String,
    data: Vec<u8>,
    map: SparseMap,
}

fn resolve_resource(base_dir: &Path, name: &str, host_path: &str) -> Result<ResolvedResource> {
    let path = resolve_host_path(base_dir, host_path);
    let contents = fs::read(&path).map_err(|e| {
        FwForgeError::config(format!(
            "file-resource '{name}': cannot read '{}': {e}",
            path.display()
        ))
    })?;

    let map = SparseMap::scan(&contents);

    // Keep only the data runs; holes are implied by the map.
    let mut data = Vec::with_capacity(map.data_size() as usize);
    let mut consumed = 0usize;
    for (i, &run) in map.runs().iter().enumerate() {
        if i % 2 == 0 {
            data.extend_from_slice(&contents[consumed..consumed + run as usize]);
        }
        consumed += run as usize;
    }

    debug!(
        "resource '{name}': {} bytes, {} data bytes across {} runs",
        map.total_size(),
        map.data_size(),
        map.runs().len()
    );
    Ok(ResolvedResource {
        name: name.to_string(),
        data,
        map,
    })
}

fn resolve_host_path(base_dir: &Path, host_path: &str) -> PathBuf {
    let path = Path::new(host_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn create(config_path: &Path, output_path: &Path) -> Result<()> {
    let text = fs::read_to_string(config_path).map_err(|e| {
        FwForgeError::config(format!(
            "cannot read configuration '{}': {e}",
            config_path.display()
        ))
    })?;
    let mut cfg = FwConfig::from_json(&text)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    // Resolve MBR bootstrap code files into the manifest.
    for spec in &mut cfg.mbrs {
        if let Some(host_path) = spec.bootstrap_code_host_path.take() {
            let path = resolve_host_path(base_dir, &host_path);
            let code = fs::read(&path).map_err(|e| {
                FwForgeError::config(format!(
                    "mbr '{}': cannot read bootstrap code '{}': {e}",
                    spec.name,
                    path.display()
                ))
            })?;
            spec.bootstrap_code = Some(hex::encode(code));
        }
    }

    // Resolve resources and fill in their manifest entries.
    let mut resolved = Vec::new();
    for resource in &mut cfg.file_resources {
        let host_path = resource.host_path.clone().ok_or_else(|| {
            FwForgeError::config(format!(
                "file-resource '{}' has no host-path",
                resource.name
            ))
        })?;
        let item = resolve_resource(base_dir, &resource.name, &host_path)?;
        resource.length = item.map.runs().to_vec();
        resource.blake2b_256 = Some(digest(&item.data));
        resolved.push(item);
    }

    validate_config(&cfg)?;

    let mut writer = ArchiveWriter::create(output_path)?;
    writer.write_manifest(&cfg)?;
    for item in &resolved {
        writer.start_entry(&item.name)?;
        writer.write_all(&item.data)?;
    }
    writer.finish()?;

    info!(
        "created '{}' with {} resources",
        output_path.display(),
        resolved.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;

    #[test]
    fn test_validate_config_rejects_bad_funlist() {
        let cfg = FwConfig::from_json(
            r#"{
                "task": [{
                    "name": "complete",
                    "on-init": ["2", "fat_mkfs", "63"]
                }]
            }"#,
        )
        .unwrap();
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("fat_mkfs"));
    }

    #[test]
    fn test_validate_config_rejects_file_action_in_on_init() {
        let cfg = FwConfig::from_json(
            r#"{
                "task": [{
                    "name": "complete",
                    "on-init": ["2", "raw_write", "0"]
                }]
            }"#,
        )
        .unwrap();
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("on-resource"));
    }

    #[test]
    fn test_create_resolves_hashes_and_sparse_maps() {
        let dir = tempfile::tempdir().unwrap();

        // A resource with a big trailing hole.
        let mut payload = vec![0xA5u8; 1024];
        payload.extend_from_slice(&vec![0u8; 8192]);
        fs::write(dir.path().join("rootfs.img"), &payload).unwrap();

        let config = r#"{
            "file-resource": [
                {"name": "rootfs.img", "host-path": "rootfs.img"}
            ],
            "task": [{
                "name": "complete",
                "on-resource": [
                    {"name": "rootfs.img", "funlist": ["2", "raw_write", "0"]}
                ]
            }]
        }"#;
        let config_path = dir.path().join("fw.json");
        fs::write(&config_path, config).unwrap();

        let archive_path = dir.path().join("fw.fw");
        create(&config_path, &archive_path).unwrap();

        let mut reader = ArchiveReader::open(&archive_path).unwrap();
        let cfg = reader.manifest().unwrap();
        let resource = cfg.resource("rootfs.img").unwrap();
        assert_eq!(resource.length, vec![1024, 8192]);
        assert_eq!(resource.expected_hash().unwrap(), digest(&payload[..1024]));

        // The archive carries only the data bytes.
        let mut entry = reader.entry_by_name("rootfs.img").unwrap();
        let mut stored = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut stored).unwrap();
        assert_eq!(stored, &payload[..1024]);
    }

    #[test]
    fn test_create_requires_host_path() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fw.json");
        fs::write(
            &config_path,
            r#"{"file-resource": [{"name": "x"}]}"#,
        )
        .unwrap();

        let err = create(&config_path, &dir.path().join("fw.fw")).unwrap_err();
        assert!(err.to_string().contains("host-path"));
    }
}
