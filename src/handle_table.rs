//! Fallback discovery: walk the system-wide handle table.
//!
//! The kernel hands back a point-in-time snapshot. Handles opened after it
//! are missed and handles closed since are still listed; both are expected.

use std::path::Path;

use thiserror::Error;

#[cfg(windows)]
use crate::handle::{self, BorrowedHandle, ProcessHandleCache};
#[cfg(windows)]
use crate::inventory::{HandleKind, LockRecord};
#[cfg(windows)]
use crate::ntdll;
#[cfg(windows)]
use crate::path::{self, DeviceMap};
#[cfg(windows)]
use crate::process;
use crate::process::ProcessTable;
#[cfg(windows)]
use crate::{object, section};

#[cfg(not(windows))]
use crate::inventory::LockRecord;

/// Attempts at sizing the handle-table buffer before giving up.
pub const MAX_QUERY_ATTEMPTS: u32 = 5;
pub const INITIAL_TABLE_BUFFER: usize = 1024 * 1024;
const GROWTH_INCREMENT: usize = 64 * 1024;

const PTR: usize = std::mem::size_of::<usize>();
/// `NumberOfHandles` + `Reserved`.
const HEADER_SIZE: usize = 2 * PTR;
/// `SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX`: Object, UniqueProcessId, HandleValue,
/// GrantedAccess, CreatorBackTraceIndex, ObjectTypeIndex, HandleAttributes, Reserved.
pub const ENTRY_SIZE: usize = 3 * PTR + 16;

// Access masks of synchronous pipe handles; name queries on them can block forever.
const HANG_PRONE_ACCESS: [u32; 4] = [0x0012_019f, 0x001a_019f, 0x0012_0189, 0x0010_0000];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("handle table query still too small after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("handle table query failed with status {0:#010x}")]
    Status(i32),

    #[error("object type tag for '{0}' could not be resolved")]
    UnknownObjectType(&'static str),

    #[error("handle table enumeration is not supported on this platform")]
    Unsupported,
}

/// Result of one sized query against the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Complete,
    TooSmall { required: usize },
    Failed(i32),
}

impl QueryStatus {
    #[cfg(windows)]
    pub fn from_ntstatus(status: i32, required: usize) -> Self {
        if ntdll::is_length_mismatch(status) {
            QueryStatus::TooSmall { required }
        } else if status >= 0 {
            QueryStatus::Complete
        } else {
            QueryStatus::Failed(status)
        }
    }
}

/// Runs an "ask size, then fetch" query, growing the buffer to the reported
/// size plus a fixed increment until it fits or `max_attempts` is reached.
pub fn query_with_growth<F>(
    initial: usize,
    max_attempts: u32,
    mut query: F,
) -> Result<Vec<u8>, TableError>
where
    F: FnMut(&mut [u8]) -> QueryStatus,
{
    let mut size = initial.max(1);

    for attempt in 1..=max_attempts {
        let mut buffer = vec![0u8; size];
        match query(&mut buffer) {
            QueryStatus::Complete => return Ok(buffer),
            QueryStatus::TooSmall { required } => {
                tracing::debug!(attempt, size, required, "query buffer too small");
                size = required.max(size) + GROWTH_INCREMENT;
            }
            QueryStatus::Failed(status) => return Err(TableError::Status(status)),
        }
    }

    Err(TableError::RetriesExhausted {
        attempts: max_attempts,
    })
}

/// One row of the system handle table. `handle_value` only has meaning
/// inside `process_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub process_id: u32,
    pub handle_value: usize,
    pub granted_access: u32,
    pub object_type: u16,
}

impl HandleEntry {
    pub fn is_hang_prone(&self) -> bool {
        HANG_PRONE_ACCESS.contains(&self.granted_access)
    }
}

fn read_usize(buf: &[u8], offset: usize) -> usize {
    let mut bytes = [0u8; PTR];
    bytes.copy_from_slice(&buf[offset..offset + PTR]);
    usize::from_ne_bytes(bytes)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_ne_bytes(bytes)
}

/// Parses a `SYSTEM_HANDLE_INFORMATION_EX` buffer. A declared count larger
/// than the buffer holds is clamped rather than trusted.
pub fn parse_handle_table(buffer: &[u8]) -> Vec<HandleEntry> {
    if buffer.len() < HEADER_SIZE {
        return Vec::new();
    }

    let declared = read_usize(buffer, 0);
    let fits = (buffer.len() - HEADER_SIZE) / ENTRY_SIZE;
    let count = declared.min(fits);

    (0..count)
        .map(|i| {
            let base = HEADER_SIZE + i * ENTRY_SIZE;
            HandleEntry {
                process_id: read_usize(buffer, base + PTR) as u32,
                handle_value: read_usize(buffer, base + 2 * PTR),
                granted_access: read_u32(buffer, base + 3 * PTR),
                object_type: read_u16(buffer, base + 3 * PTR + 6),
            }
        })
        .collect()
}

#[cfg(windows)]
pub fn snapshot() -> Result<Vec<HandleEntry>, TableError> {
    let buffer = query_with_growth(INITIAL_TABLE_BUFFER, MAX_QUERY_ATTEMPTS, |buf| {
        let mut required: u32 = 0;
        let status = unsafe {
            ntdll::NtQuerySystemInformation(
                ntdll::SYSTEM_EXTENDED_HANDLE_INFORMATION,
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut required,
            )
        };
        QueryStatus::from_ntstatus(status.0, required as usize)
    })?;

    Ok(parse_handle_table(&buffer))
}

#[cfg(not(windows))]
pub fn snapshot() -> Result<Vec<HandleEntry>, TableError> {
    Err(TableError::Unsupported)
}

/// Finds file handles in `entries`, in any process (or only in `owners`),
/// whose object name is `target` or lies inside it.
///
/// Handles that cannot be duplicated are skipped silently: the owner may have
/// exited, closed the handle, or denied us access since the snapshot.
#[cfg(windows)]
pub fn scan_open_files(
    target: &Path,
    owners: Option<&[u32]>,
    entries: &[HandleEntry],
    processes: &ProcessTable,
) -> Result<Vec<LockRecord>, TableError> {
    let file_tag = section::file_type_tag().ok_or(TableError::UnknownObjectType("File"))?;
    let devices = DeviceMap::load();
    let target_str = target.to_string_lossy();

    let mut process_handles = ProcessHandleCache::default();
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for entry in entries.iter().filter(|e| e.object_type == file_tag) {
        if process::is_critical_pid(entry.process_id) || entry.is_hang_prone() {
            continue;
        }
        if let Some(owners) = owners {
            if !owners.contains(&entry.process_id) {
                continue;
            }
        }

        let Some(owner) = process_handles.get(entry.process_id) else {
            skipped += 1;
            continue;
        };
        let Some(local) = handle::duplicate_from(owner, entry.handle_value) else {
            skipped += 1;
            continue;
        };
        if !object::is_disk_file(&local) {
            continue;
        }
        let Some(name) = object::resolve_name(&local, &devices) else {
            continue;
        };
        if !path::covers(&target_str, &name) {
            continue;
        }

        records.push(LockRecord {
            process_id: entry.process_id,
            process_name: processes.name_of(entry.process_id),
            borrowed_handle: Some(BorrowedHandle::new(
                entry.process_id,
                entry.handle_value,
                local,
            )),
            file_path: name,
            handle_kind: HandleKind::OpenFile,
        });
    }

    tracing::debug!(
        total = entries.len(),
        skipped,
        found = records.len(),
        "handle table scan finished"
    );
    Ok(records)
}

#[cfg(not(windows))]
pub fn scan_open_files(
    _target: &Path,
    _owners: Option<&[u32]>,
    _entries: &[HandleEntry],
    _processes: &ProcessTable,
) -> Result<Vec<LockRecord>, TableError> {
    Err(TableError::Unsupported)
}

#[cfg(test)]
pub(crate) fn encode_handle_table(declared: usize, entries: &[HandleEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + entries.len() * ENTRY_SIZE);
    buf.extend_from_slice(&declared.to_ne_bytes());
    buf.extend_from_slice(&0usize.to_ne_bytes());
    for (i, entry) in entries.iter().enumerate() {
        buf.extend_from_slice(&(0x1000usize + i).to_ne_bytes());
        buf.extend_from_slice(&(entry.process_id as usize).to_ne_bytes());
        buf.extend_from_slice(&entry.handle_value.to_ne_bytes());
        buf.extend_from_slice(&entry.granted_access.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&entry.object_type.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
    }
    buf
}
