//! What holds a path, gathered from every discovery strategy.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Serialize, Serializer};

use crate::handle::BorrowedHandle;
use crate::handle_table::TableError;
use crate::path;
use crate::platform::Platform;
use crate::process;
use crate::tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandleKind {
    OpenFile,
    MemoryMapped,
    WorkingDirectory,
}

impl HandleKind {
    /// Preference when two records describe the same process and path.
    fn rank(self) -> u8 {
        match self {
            HandleKind::MemoryMapped => 2,
            HandleKind::WorkingDirectory => 1,
            HandleKind::OpenFile => 0,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandleKind::OpenFile => "open file",
            HandleKind::MemoryMapped => "memory-mapped",
            HandleKind::WorkingDirectory => "working directory",
        };
        f.write_str(label)
    }
}

/// A process as reported by Restart Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// "Process P references path F via K", valid for one inventory pass.
#[derive(Debug, Serialize)]
pub struct LockRecord {
    pub process_id: u32,
    pub process_name: String,
    #[serde(rename = "handle", serialize_with = "serialize_handle")]
    pub borrowed_handle: Option<BorrowedHandle>,
    pub file_path: String,
    pub handle_kind: HandleKind,
}

fn serialize_handle<S>(handle: &Option<BorrowedHandle>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    handle
        .as_ref()
        .map(BorrowedHandle::remote_value)
        .serialize(serializer)
}

impl LockRecord {
    pub fn is_closeable(&self) -> bool {
        self.borrowed_handle.is_some()
    }

    /// Identity of the holder, detached from any handle.
    pub fn holder(&self) -> LockHolder {
        LockHolder {
            process_id: self.process_id,
            process_name: self.process_name.clone(),
            file_path: self.file_path.clone(),
            handle_kind: self.handle_kind,
        }
    }

    fn dedup_key(&self) -> (u32, String) {
        (self.process_id, path::comparison_key(&self.file_path))
    }

    fn outranks(&self, other: &LockRecord) -> bool {
        (self.is_closeable(), self.handle_kind.rank())
            > (other.is_closeable(), other.handle_kind.rank())
    }
}

/// A lock holder that survived unlocking, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub process_id: u32,
    pub process_name: String,
    pub file_path: String,
    pub handle_kind: HandleKind,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.process_name.is_empty() {
            "<exited>"
        } else {
            &self.process_name
        };
        write!(
            f,
            "{} (PID {}) holds '{}' [{}]",
            name, self.process_id, self.file_path, self.handle_kind
        )
    }
}

/// A process that only looks related to the target. Never closed into or killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suspect {
    pub process_id: u32,
    pub process_name: String,
    pub reason: String,
}

/// Which open-file strategy produced the records of a pass.
#[derive(Debug)]
pub enum Discovery {
    Managed(Vec<LockRecord>),
    Legacy(Vec<LockRecord>),
    Unavailable(TableError),
}

impl Discovery {
    /// Restart Manager per file; the handle table only if that fails anywhere.
    pub fn run(platform: &dyn Platform, target: &Path) -> Self {
        match query_managed(platform, target) {
            Ok(records) => Discovery::Managed(records),
            Err(e) => {
                tracing::warn!("Restart Manager query failed, scanning handle table: {}", e);
                match platform.scan_handle_table(target, None) {
                    Ok(records) => Discovery::Legacy(records),
                    Err(e) => {
                        tracing::warn!("handle table scan failed: {}", e);
                        Discovery::Unavailable(e)
                    }
                }
            }
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Discovery::Managed(_) => "restart-manager",
            Discovery::Legacy(_) => "handle-table",
            Discovery::Unavailable(_) => "none",
        }
    }

    pub fn into_records(self) -> Vec<LockRecord> {
        match self {
            Discovery::Managed(records) | Discovery::Legacy(records) => records,
            Discovery::Unavailable(_) => Vec::new(),
        }
    }
}

fn query_managed(platform: &dyn Platform, target: &Path) -> std::io::Result<Vec<LockRecord>> {
    let mut records = Vec::new();
    for file in tree::expand_files(target) {
        let file_path = file.to_string_lossy().into_owned();
        for entry in platform.query_managed(&file)? {
            records.push(LockRecord {
                process_id: entry.pid,
                process_name: entry.name,
                borrowed_handle: None,
                file_path: file_path.clone(),
                handle_kind: HandleKind::OpenFile,
            });
        }
    }
    Ok(records)
}

/// Deduplicated result of one scan of a target.
#[derive(Debug)]
pub struct LockInventory {
    pub strategy: &'static str,
    pub records: Vec<LockRecord>,
    /// Records folded into a preferred one during dedup. Their handles are
    /// still worth closing.
    pub shadowed: Vec<LockRecord>,
    pub suspects: Vec<Suspect>,
}

impl LockInventory {
    pub fn collect(platform: &dyn Platform, target: &Path) -> Self {
        platform.begin_pass();
        let inventory = Self::gather(platform, target);
        platform.end_pass();
        inventory
    }

    fn gather(platform: &dyn Platform, target: &Path) -> Self {
        let discovery = Discovery::run(platform, target);
        let strategy = discovery.strategy();

        let mut found = discovery.into_records();
        found.extend(platform.scan_mapped_sections(target));
        found.extend(platform.scan_working_directories(target));
        found.retain(|r| !process::is_critical_pid(r.process_id));

        let (records, shadowed) = dedup(found);

        let mut suspects = platform.command_line_suspects(target);
        suspects.retain(|s| records.iter().all(|r| r.process_id != s.process_id));

        tracing::debug!(
            strategy,
            records = records.len(),
            shadowed = shadowed.len(),
            suspects = suspects.len(),
            "inventory collected"
        );

        Self {
            strategy,
            records,
            shadowed,
            suspects,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn holders(&self) -> Vec<LockHolder> {
        self.records.iter().map(LockRecord::holder).collect()
    }

    pub fn into_records(self) -> Vec<LockRecord> {
        self.records
    }
}

/// Keeps one record per (process, path), preferring closeable records and
/// then mapped sections over working directories over open files.
pub fn dedup(found: Vec<LockRecord>) -> (Vec<LockRecord>, Vec<LockRecord>) {
    let mut records: Vec<LockRecord> = Vec::new();
    let mut index: HashMap<(u32, String), usize> = HashMap::new();
    let mut shadowed = Vec::new();

    for record in found {
        match index.get(&record.dedup_key()) {
            Some(&at) => {
                if record.outranks(&records[at]) {
                    let previous = std::mem::replace(&mut records[at], record);
                    shadowed.push(previous);
                } else {
                    shadowed.push(record);
                }
            }
            None => {
                index.insert(record.dedup_key(), records.len());
                records.push(record);
            }
        }
    }

    (records, shadowed)
}
