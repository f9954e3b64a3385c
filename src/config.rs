//! Typed view of the firmware configuration document.
//!
//! The configuration is produced externally and travels inside the archive
//! as its first entry (`meta.json`). This module holds the data model and
//! the accessors the engine consumes: section lookups and the flattened
//! funlist streams attached to task events.

use serde::{Deserialize, Serialize};

use crate::error::{FwForgeError, Result};
use crate::sparse::SparseMap;

/// Archive entry name of the serialized configuration.
pub const MANIFEST_ENTRY: &str = "meta.json";

/// Hex digits in a BLAKE2b-256 digest.
pub const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FwConfig {
    #[serde(default)]
    pub meta: MetaSection,
    #[serde(default, rename = "file-resource")]
    pub file_resources: Vec<FileResource>,
    #[serde(default, rename = "mbr")]
    pub mbrs: Vec<MbrSpec>,
    #[serde(default, rename = "uboot-environment")]
    pub uboot_environments: Vec<UBootEnvSpec>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaSection {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// A named payload carried by the archive plus its manifest entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileResource {
    pub name: String,
    /// Source file on the machine creating the archive. Not used at apply
    /// time.
    #[serde(default)]
    pub host_path: Option<String>,
    /// Alternating data/hole run lengths, data first.
    #[serde(default)]
    pub length: Vec<u64>,
    #[serde(default, rename = "blake2b-256")]
    pub blake2b_256: Option<String>,
}

impl FileResource {
    pub fn sparse_map(&self) -> Result<SparseMap> {
        SparseMap::from_runs(&self.length)
    }

    /// The declared digest, validated for shape.
    pub fn expected_hash(&self) -> Result<&str> {
        match self.blake2b_256.as_deref() {
            Some(hash) if hash.len() == HASH_HEX_LEN => Ok(hash),
            _ => Err(FwForgeError::config(format!(
                "invalid blake2b-256 hash for '{}'",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MbrSpec {
    pub name: String,
    /// Bootstrap region contents as hex, at most 440 bytes decoded. The
    /// create side resolves `bootstrap-code-host-path` into this field.
    #[serde(default)]
    pub bootstrap_code: Option<String>,
    /// Source file for the bootstrap region. Only meaningful at create
    /// time.
    #[serde(default)]
    pub bootstrap_code_host_path: Option<String>,
    #[serde(default)]
    pub signature: Option<u32>,
    #[serde(default, rename = "partition")]
    pub partitions: Vec<MbrPartitionSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MbrPartitionSpec {
    pub block_offset: u32,
    pub block_count: u32,
    #[serde(rename = "type")]
    pub partition_type: u8,
    #[serde(default)]
    pub boot: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UBootEnvSpec {
    pub name: String,
    pub block_offset: u64,
    pub block_count: u64,
}

/// A flattened funlist: `"<argc>", "<name>", "<arg1>", …` repeated. The
/// stream is re-walkable; both the progress pass and the run pass iterate
/// it from the start.
pub type Funlist = Vec<String>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub require_partition_offset: Vec<PartitionOffsetRequirement>,
    #[serde(default)]
    pub require_fat_file_exists: Vec<FatFileRequirement>,
    #[serde(default)]
    pub require_uboot_variable: Vec<UBootVariableRequirement>,
    #[serde(default)]
    pub on_init: Funlist,
    #[serde(default)]
    pub on_resource: Vec<OnResource>,
    #[serde(default)]
    pub on_finish: Funlist,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OnResource {
    /// File-resource name this event binds to.
    pub name: String,
    /// Archive entries referenced by the task but absent from the archive
    /// are fatal unless the event is optional.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub funlist: Funlist,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionOffsetRequirement {
    pub partition: usize,
    pub block_offset: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FatFileRequirement {
    pub block_offset: u64,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UBootVariableRequirement {
    pub environment: String,
    pub name: String,
    pub value: String,
}

impl FwConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| FwForgeError::config(format!("bad configuration document: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FwForgeError::config(format!("cannot serialize configuration: {e}")))
    }

    pub fn resource(&self, name: &str) -> Option<&FileResource> {
        self.file_resources.iter().find(|r| r.name == name)
    }

    pub fn mbr(&self, name: &str) -> Option<&MbrSpec> {
        self.mbrs.iter().find(|m| m.name == name)
    }

    pub fn uboot_environment(&self, name: &str) -> Option<&UBootEnvSpec> {
        self.uboot_environments.iter().find(|u| u.name == name)
    }

    /// Tasks whose name equals `requested` or extends it with a `.`-separated
    /// suffix, in declaration order. The apply driver runs the first one
    /// whose requirements pass.
    pub fn tasks_matching<'a>(&'a self, requested: &'a str) -> impl Iterator<Item = &'a TaskSpec> {
        self.tasks.iter().filter(move |t| {
            t.name == requested
                || (t.name.len() > requested.len()
                    && t.name.starts_with(requested)
                    && t.name.as_bytes()[requested.len()] == b'.')
        })
    }
}

/// Parse an unsigned integer operand in C-style base: decimal by default,
/// `0x` prefix for hex, leading `0` for octal.
pub fn parse_uint(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8)
    } else {
        text.parse()
    };
    parsed.map_err(|_| FwForgeError::validation(format!("'{text}' is not a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uint_bases() {
        assert_eq!(parse_uint("0").unwrap(), 0);
        assert_eq!(parse_uint("2048").unwrap(), 2048);
        assert_eq!(parse_uint("0x800").unwrap(), 0x800);
        assert_eq!(parse_uint("0X10").unwrap(), 16);
        assert_eq!(parse_uint("0755").unwrap(), 0o755);
    }

    #[test]
    fn test_parse_uint_rejects_garbage() {
        assert!(parse_uint("").is_err());
        assert!(parse_uint("-1").is_err());
        assert!(parse_uint("12ab").is_err());
        assert!(parse_uint("0xZZ").is_err());
    }

    #[test]
    fn test_task_prefix_matching() {
        let json = r#"{
            "task": [
                {"name": "upgrade.a"},
                {"name": "upgrade.b"},
                {"name": "upgrader"},
                {"name": "complete"}
            ]
        }"#;
        let cfg = FwConfig::from_json(json).unwrap();

        let names: Vec<&str> = cfg
            .tasks_matching("upgrade")
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["upgrade.a", "upgrade.b"]);

        let names: Vec<&str> = cfg
            .tasks_matching("complete")
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["complete"]);

        assert_eq!(cfg.tasks_matching("missing").count(), 0);
    }

    #[test]
    fn test_resource_lookup_and_hash_shape() {
        let json = r#"{
            "file-resource": [
                {"name": "rootfs.img", "length": [1024], "blake2b-256": "ab"}
            ]
        }"#;
        let cfg = FwConfig::from_json(json).unwrap();
        let res = cfg.resource("rootfs.img").unwrap();
        assert_eq!(res.sparse_map().unwrap().data_size(), 1024);
        assert!(res.expected_hash().is_err());
        assert!(cfg.resource("missing").is_none());
    }

    #[test]
    fn test_config_round_trip() {
        let json = r#"{
            "meta": {"product": "demo", "version": "1.0.0"},
            "mbr": [{
                "name": "main",
                "signature": 16909060,
                "partition": [
                    {"block-offset": 63, "block-count": 77238, "type": 12, "boot": true}
                ]
            }],
            "uboot-environment": [
                {"name": "env", "block-offset": 2016, "block-count": 16}
            ],
            "task": [{
                "name": "complete",
                "on-init": ["3", "fat_mkfs", "63", "77238"],
                "on-resource": [
                    {"name": "boot.img", "funlist": ["2", "raw_write", "77301"]}
                ]
            }]
        }"#;
        let cfg = FwConfig::from_json(json).unwrap();
        let round = FwConfig::from_json(&cfg.to_json().unwrap()).unwrap();

        assert_eq!(round.meta.product.as_deref(), Some("demo"));
        assert_eq!(round.mbr("main").unwrap().partitions.len(), 1);
        assert_eq!(round.uboot_environment("env").unwrap().block_offset, 2016);
        let task = round.tasks_matching("complete").next().unwrap();
        assert_eq!(task.on_init, vec!["3", "fat_mkfs", "63", "77238"]);
        assert_eq!(task.on_resource[0].name, "boot.img");
    }
}
