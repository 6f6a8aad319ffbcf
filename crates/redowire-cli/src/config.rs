//! Configuration document.
//!
//! One JSON file enumerates sources (databases whose redo is parsed) and
//! targets (writers consuming a source's stream). The core never sees
//! raw JSON; everything is converted to typed options here.

use std::path::{Path, PathBuf};

use redowire_error::{RedowireError, Result};
use redowire_metadata::schema::TableFilterRule;
use serde::Deserialize;

fn default_log_level() -> u8 {
    3
}

fn default_memory_min() -> u64 {
    32
}

fn default_memory_max() -> u64 {
    1024
}

fn default_read_buffer_mb() -> u64 {
    4
}

fn default_checkpoints_keep() -> usize {
    3
}

fn default_state_type() -> String {
    "disk".to_owned()
}

fn default_block_checksum() -> String {
    "TYPICAL".to_owned()
}

fn default_format_type() -> String {
    "json".to_owned()
}

fn default_one() -> u8 {
    1
}

fn default_queue_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "log-level", default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub state: StateConfig,
    #[serde(rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(rename = "target", default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "min-mb", default = "default_memory_min")]
    pub min_mb: u64,
    #[serde(rename = "max-mb", default = "default_memory_max")]
    pub max_mb: u64,
    #[serde(rename = "read-buffer-mb", default = "default_read_buffer_mb")]
    pub read_buffer_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_mb: default_memory_min(),
            max_mb: default_memory_max(),
            read_buffer_mb: default_read_buffer_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(rename = "type", default = "default_state_type")]
    pub kind: String,
    pub path: String,
    #[serde(rename = "checkpoints-keep", default = "default_checkpoints_keep")]
    pub checkpoints_keep: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub alias: String,
    /// Database name; prefixes checkpoint files.
    pub name: String,
    pub reader: ReaderSection,
    #[serde(default)]
    pub format: Option<FormatSection>,
    /// Bit 1 (value 2): schemaless mode.
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub filter: Option<FilterSection>,
    /// Schema seed document, required unless schemaless.
    #[serde(default)]
    pub schema: Option<PathBuf>,
    /// Flattened `(from, to, from, to, ...)` prefix pairs.
    #[serde(rename = "path-mapping", default)]
    pub path_mapping: Vec<String>,
    #[serde(default)]
    pub debug: Option<DebugSection>,
}

pub const FLAG_SCHEMALESS: u32 = 0x02;

impl SourceConfig {
    #[must_use]
    pub fn schemaless(&self) -> bool {
        self.flags & FLAG_SCHEMALESS != 0
    }

    pub fn path_mapping_pairs(&self) -> Result<Vec<(String, String)>> {
        if self.path_mapping.len() % 2 != 0 {
            return Err(RedowireError::BadConfig {
                detail: format!(
                    "path-mapping of source '{}' has an odd number of entries",
                    self.alias
                ),
            });
        }
        Ok(self
            .path_mapping
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderSection {
    /// `batch` processes the listed files and stops; `offline` follows
    /// archives and online logs continuously.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "redo-log", default)]
    pub redo_log: Vec<String>,
    #[serde(rename = "online-redo", default)]
    pub online_redo: Vec<OnlineRedoConfig>,
    #[serde(rename = "log-archive-format", default)]
    pub log_archive_format: String,
    #[serde(rename = "db-recovery-file-dest", default)]
    pub db_recovery_file_dest: String,
    #[serde(default)]
    pub context: String,
    #[serde(rename = "db-block-checksum", default = "default_block_checksum")]
    pub db_block_checksum: String,
    #[serde(rename = "db-timezone", default)]
    pub db_timezone: Option<String>,
    #[serde(rename = "start-scn", default)]
    pub start_scn: Option<u64>,
    #[serde(rename = "start-seq", default)]
    pub start_seq: Option<u32>,
    #[serde(rename = "start-time", default)]
    pub start_time: Option<String>,
    #[serde(rename = "disable-checks", default)]
    pub disable_checks: u32,
    #[serde(rename = "arch-read-tries", default)]
    pub arch_read_tries: Option<u32>,
    #[serde(rename = "arch-read-sleep-us", default)]
    pub arch_read_sleep_us: Option<u64>,
    #[serde(rename = "redo-read-sleep-us", default)]
    pub redo_read_sleep_us: Option<u64>,
    #[serde(rename = "refresh-interval-us", default)]
    pub refresh_interval_us: Option<u64>,
    #[serde(rename = "max-pending-transactions", default)]
    pub max_pending_transactions: Option<usize>,
    #[serde(rename = "boot-failsafe", default)]
    pub boot_failsafe: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnlineRedoConfig {
    pub thread: u16,
    pub group: i32,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatSection {
    #[serde(rename = "type", default = "default_format_type")]
    pub kind: String,
    #[serde(default = "default_one")]
    pub scn: u8,
    #[serde(default = "default_one")]
    pub timestamp: u8,
    #[serde(default = "default_one")]
    pub xid: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub table: Vec<TableFilterRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugSection {
    #[serde(rename = "stop-log-switches", default)]
    pub stop_log_switches: Option<u32>,
    #[serde(rename = "stop-transactions", default)]
    pub stop_transactions: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub alias: String,
    /// Alias of the source this target consumes.
    pub source: String,
    pub writer: WriterSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterSection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(rename = "new-line", default = "default_one")]
    pub new_line: u8,
    #[serde(default)]
    pub append: u8,
    #[serde(rename = "queue-size", default = "default_queue_size")]
    pub queue_size: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text).map_err(|e| RedowireError::BadConfig {
            detail: format!("'{}': {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(RedowireError::BadConfig {
                detail: "no sources configured".to_owned(),
            });
        }
        if self.state.kind != "disk" {
            return Err(RedowireError::BadConfig {
                detail: format!("unsupported state type '{}'", self.state.kind),
            });
        }
        if self.memory.min_mb > self.memory.max_mb {
            return Err(RedowireError::BadConfig {
                detail: format!(
                    "memory.min-mb ({}) exceeds memory.max-mb ({})",
                    self.memory.min_mb, self.memory.max_mb
                ),
            });
        }
        for source in &self.sources {
            match source.reader.kind.as_str() {
                "batch" | "offline" => {}
                other => {
                    return Err(RedowireError::BadConfig {
                        detail: format!("unsupported reader type '{other}'"),
                    })
                }
            }
            if !source.schemaless() && source.schema.is_none() {
                return Err(RedowireError::BadConfig {
                    detail: format!(
                        "source '{}' has no schema and schemaless mode is off",
                        source.alias
                    ),
                });
            }
            source.path_mapping_pairs()?;
        }
        for target in &self.targets {
            if !self.sources.iter().any(|s| s.alias == target.source) {
                return Err(RedowireError::BadConfig {
                    detail: format!(
                        "target '{}' references unknown source '{}'",
                        target.alias, target.source
                    ),
                });
            }
            if target.writer.kind != "file" {
                return Err(RedowireError::BadConfig {
                    detail: format!("unsupported writer type '{}'", target.writer.kind),
                });
            }
            if target.writer.new_line == 0 {
                return Err(RedowireError::BadConfig {
                    detail: "file writer requires new-line output".to_owned(),
                });
            }
        }
        Ok(())
    }
}
