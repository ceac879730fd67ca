//! Object-type tags and memory-mapped file detection.
//!
//! The numeric type index the kernel stores per handle ("File", "Section",
//! ...) changes between OS builds. We learn it once per process by looking
//! at our own handles, which are always accessible, and keep it for the
//! life of the process.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{const_mutex, Mutex};

use crate::handle_table::HandleEntry;
use crate::inventory::LockRecord;
use crate::process::ProcessTable;

#[cfg(windows)]
use windows::core::PCWSTR;
#[cfg(windows)]
use windows::Win32::Foundation::{HANDLE, INVALID_HANDLE_VALUE};
#[cfg(windows)]
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_READ,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READONLY,
};
#[cfg(windows)]
use windows::Win32::System::ProcessStatus::GetMappedFileNameW;
#[cfg(windows)]
use windows::Win32::System::Threading::GetCurrentProcess;

#[cfg(windows)]
use crate::handle::{self, BorrowedHandle, OwnedHandle, ProcessHandleCache};
#[cfg(windows)]
use crate::handle_table;
#[cfg(windows)]
use crate::inventory::HandleKind;
#[cfg(windows)]
use crate::object;
#[cfg(windows)]
use crate::path::{self, DeviceMap};
#[cfg(windows)]
use crate::process;

/// Write-once cell for an object-type tag.
///
/// Reads are a single atomic load. Resolution and the one write are
/// serialized by a mutex; a failed resolution stores nothing, so the next
/// caller tries again.
pub struct TypeTagCell {
    // 0 = unknown, otherwise tag + 1.
    value: AtomicU32,
    write: Mutex<()>,
}

impl TypeTagCell {
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            write: const_mutex(()),
        }
    }

    pub fn get(&self) -> Option<u16> {
        match self.value.load(Ordering::Acquire) {
            0 => None,
            stored => Some((stored - 1) as u16),
        }
    }

    pub fn get_or_resolve<F>(&self, resolve: F) -> Option<u16>
    where
        F: FnOnce() -> Option<u16>,
    {
        if let Some(tag) = self.get() {
            return Some(tag);
        }

        let _guard = self.write.lock();
        if let Some(tag) = self.get() {
            return Some(tag);
        }

        let tag = resolve()?;
        self.value.store(u32::from(tag) + 1, Ordering::Release);
        Some(tag)
    }
}

impl Default for TypeTagCell {
    fn default() -> Self {
        Self::new()
    }
}

static SECTION_TAG: TypeTagCell = TypeTagCell::new();
static FILE_TAG: TypeTagCell = TypeTagCell::new();

/// Type tag of "Section" objects, resolved on first use.
pub fn section_type_tag() -> Option<u16> {
    SECTION_TAG.get_or_resolve(|| resolve_own_type_tag("Section"))
}

/// Type tag of "File" objects, resolved on first use.
pub fn file_type_tag() -> Option<u16> {
    FILE_TAG.get_or_resolve(|| resolve_own_type_tag("File"))
}

/// Scans this process's handles for the first object whose type name is
/// `type_name`, keeping a probe object of that type open meanwhile.
#[cfg(windows)]
fn resolve_own_type_tag(type_name: &'static str) -> Option<u16> {
    let probe = Probe::open(type_name);
    let entries = match handle_table::snapshot() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot resolve '{}' type tag: {}", type_name, e);
            return None;
        }
    };

    let own_pid = std::process::id();
    let probe_value = probe.as_ref().map(Probe::value);
    let mut own: Vec<_> = entries
        .into_iter()
        .filter(|e| e.process_id == own_pid)
        .collect();
    // Look at the probe first; it is the one handle we know the type of.
    own.sort_by_key(|e| Some(e.handle_value) != probe_value);

    for entry in own {
        let name = object::type_name(HANDLE(entry.handle_value as *mut _));
        if name.as_deref() == Some(type_name) {
            tracing::debug!(type_name, tag = entry.object_type, "resolved object type tag");
            return Some(entry.object_type);
        }
    }

    tracing::warn!("no '{}' handle open in this process; tag unresolved", type_name);
    None
}

#[cfg(not(windows))]
fn resolve_own_type_tag(_type_name: &'static str) -> Option<u16> {
    None
}

/// An object of a known type held open while its tag is resolved.
#[cfg(windows)]
enum Probe {
    Section(OwnedHandle),
    File(std::fs::File),
}

#[cfg(windows)]
impl Probe {
    fn open(type_name: &str) -> Option<Self> {
        match type_name {
            "Section" => {
                let handle = unsafe {
                    CreateFileMappingW(
                        INVALID_HANDLE_VALUE,
                        None,
                        PAGE_READONLY,
                        0,
                        4096,
                        PCWSTR::null(),
                    )
                }
                .ok()?;
                OwnedHandle::new(handle).map(Probe::Section)
            }
            "File" => {
                let exe = std::env::current_exe().ok()?;
                std::fs::File::open(exe).ok().map(Probe::File)
            }
            _ => None,
        }
    }

    fn value(&self) -> usize {
        use std::os::windows::io::AsRawHandle;
        match self {
            Probe::Section(handle) => handle.raw().0 as usize,
            Probe::File(file) => file.as_raw_handle() as usize,
        }
    }
}

/// A one-page read-only view of a section, unmapped on drop.
#[cfg(windows)]
struct MappedView(MEMORY_MAPPED_VIEW_ADDRESS);

#[cfg(windows)]
impl MappedView {
    fn map(section: &OwnedHandle) -> Option<Self> {
        let view = unsafe { MapViewOfFile(section.raw(), FILE_MAP_READ, 0, 0, 1) };
        if view.Value.is_null() {
            None
        } else {
            Some(Self(view))
        }
    }

    /// Device-namespace path of the file backing this view; `None` for
    /// pagefile-backed sections.
    fn file_name(&self) -> Option<String> {
        let mut buffer = [0u16; 1024];
        let len = unsafe { GetMappedFileNameW(GetCurrentProcess(), self.0.Value, &mut buffer) };
        if len == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buffer[..len as usize]))
    }
}

#[cfg(windows)]
impl Drop for MappedView {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.0);
        }
    }
}

/// Finds section objects in `entries` backed by `target` or a file inside it.
///
/// Without a resolved Section tag this reports nothing rather than failing;
/// the tag is retried on the next call.
#[cfg(windows)]
pub fn scan_mapped_sections(
    target: &Path,
    entries: &[HandleEntry],
    processes: &ProcessTable,
) -> Vec<LockRecord> {
    let Some(section_tag) = section_type_tag() else {
        return Vec::new();
    };

    let devices = DeviceMap::load();
    let target_str = target.to_string_lossy();
    let mut process_handles = ProcessHandleCache::default();
    let mut records = Vec::new();

    for entry in entries.iter().filter(|e| e.object_type == section_tag) {
        if process::is_critical_pid(entry.process_id) {
            continue;
        }
        let Some(owner) = process_handles.get(entry.process_id) else {
            continue;
        };
        let Some(local) = handle::duplicate_from(owner, entry.handle_value) else {
            continue;
        };
        let Some(file_name) = MappedView::map(&local).and_then(|view| view.file_name()) else {
            continue;
        };
        let name = devices.to_normal(&file_name);
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
            handle_kind: HandleKind::MemoryMapped,
        });
    }

    records
}

#[cfg(not(windows))]
pub fn scan_mapped_sections(
    _target: &Path,
    _entries: &[HandleEntry],
    _processes: &ProcessTable,
) -> Vec<LockRecord> {
    Vec::new()
}
