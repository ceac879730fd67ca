//! Working-directory bindings.
//!
//! A process whose current directory is inside the target pins it without
//! holding any handle we can close. Two signals:
//!
//! * the directory recorded in the process's own parameter block
//!   (authoritative, one [`LockRecord`] per hit);
//! * a substring match of the target in the command line or executable
//!   path (advisory, reported as a [`Suspect`] and never acted on).

use std::path::Path;

use crate::inventory::{HandleKind, LockRecord, Suspect};
use crate::path;
use crate::process::{self, ProcessTable};

const PTR: usize = std::mem::size_of::<usize>();

/// Byte offsets of `PEB.ProcessParameters` and
/// `RTL_USER_PROCESS_PARAMETERS.CurrentDirectory.DosPath`.
#[cfg(target_pointer_width = "64")]
const PEB_OFFSETS: (usize, usize) = (0x20, 0x38);
#[cfg(target_pointer_width = "32")]
const PEB_OFFSETS: (usize, usize) = (0x10, 0x24);

/// `UNICODE_STRING` as laid out in another process's memory: the length in
/// bytes and the remote address of the characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteUnicodeString {
    pub length: usize,
    pub buffer: usize,
}

impl RemoteUnicodeString {
    pub const SIZE: usize = 2 * PTR;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let length = u16::from_ne_bytes([bytes[0], bytes[1]]) as usize;
        let mut ptr = [0u8; PTR];
        ptr.copy_from_slice(&bytes[PTR..2 * PTR]);
        let buffer = usize::from_ne_bytes(ptr);

        if length == 0 || length % 2 != 0 || buffer == 0 {
            None
        } else {
            Some(Self { length, buffer })
        }
    }
}

fn read_pointer(bytes: &[u8]) -> Option<usize> {
    let raw: [u8; PTR] = bytes.get(..PTR)?.try_into().ok()?;
    match usize::from_ne_bytes(raw) {
        0 => None,
        ptr => Some(ptr),
    }
}

/// Walks PEB -> process parameters -> current directory through `read`,
/// which fetches `len` bytes at a remote address.
pub fn walk_process_parameters<F>(peb: usize, mut read: F) -> Option<String>
where
    F: FnMut(usize, usize) -> Option<Vec<u8>>,
{
    let (params_offset, cwd_offset) = PEB_OFFSETS;

    let params = read_pointer(&read(peb.checked_add(params_offset)?, PTR)?)?;
    let header = read(
        params.checked_add(cwd_offset)?,
        RemoteUnicodeString::SIZE,
    )?;
    let dos_path = RemoteUnicodeString::parse(&header)?;
    let bytes = read(dos_path.buffer, dos_path.length)?;
    if bytes.len() != dos_path.length {
        return None;
    }

    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&wide).ok()
}

/// Current directory of `pid`, or `None` at the first hop that fails.
#[cfg(windows)]
pub fn read_current_directory(pid: u32) -> Option<String> {
    use std::ffi::c_void;

    use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows::Win32::System::Threading::{PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ};

    use crate::handle;
    use crate::ntdll::{self, ProcessBasicInformation};

    let process = handle::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ)?;

    let mut info = ProcessBasicInformation {
        exit_status: 0,
        peb_base_address: std::ptr::null_mut(),
        affinity_mask: 0,
        base_priority: 0,
        unique_process_id: 0,
        inherited_from_unique_process_id: 0,
    };
    let mut returned: u32 = 0;
    let status = unsafe {
        ntdll::NtQueryInformationProcess(
            process.raw(),
            ntdll::PROCESS_BASIC_INFORMATION,
            &mut info as *mut _ as *mut c_void,
            std::mem::size_of::<ProcessBasicInformation>() as u32,
            &mut returned,
        )
    };
    if status.0 < 0 || info.peb_base_address.is_null() {
        return None;
    }

    walk_process_parameters(info.peb_base_address as usize, |address, len| {
        let mut buffer = vec![0u8; len];
        let mut read: usize = 0;
        unsafe {
            ReadProcessMemory(
                process.raw(),
                address as *const c_void,
                buffer.as_mut_ptr().cast(),
                len,
                Some(&mut read),
            )
        }
        .ok()?;
        buffer.truncate(read);
        Some(buffer)
    })
}

#[cfg(target_os = "linux")]
pub fn read_current_directory(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{}/cwd", pid))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn read_current_directory(_pid: u32) -> Option<String> {
    None
}

/// Processes whose current directory is `target` or lies inside it.
pub fn scan_working_directories(target: &Path, processes: &ProcessTable) -> Vec<LockRecord> {
    scan_with(target, processes, read_current_directory)
}

pub(crate) fn scan_with<F>(target: &Path, processes: &ProcessTable, mut read_cwd: F) -> Vec<LockRecord>
where
    F: FnMut(u32) -> Option<String>,
{
    let target_str = target.to_string_lossy();
    let mut records = Vec::new();

    for summary in processes.iter() {
        if process::is_critical_pid(summary.pid) {
            continue;
        }
        let Some(cwd) = read_cwd(summary.pid) else {
            continue;
        };
        if !path::covers(&target_str, &cwd) {
            continue;
        }
        tracing::debug!(pid = summary.pid, cwd = %cwd, "working directory inside target");
        records.push(LockRecord {
            process_id: summary.pid,
            process_name: summary.name.clone(),
            borrowed_handle: None,
            file_path: cwd,
            handle_kind: HandleKind::WorkingDirectory,
        });
    }

    records
}

/// Processes that mention `target` in their command line or run from inside it.
///
/// Deliberately loose: anything merely naming the path shows up here.
pub fn command_line_suspects(target: &Path, processes: &ProcessTable) -> Vec<Suspect> {
    let target_str = target.to_string_lossy();
    let needle = path::comparison_key(&target_str);
    if needle.is_empty() {
        return Vec::new();
    }

    let mut suspects = Vec::new();
    for summary in processes.iter() {
        if process::is_critical_pid(summary.pid) {
            continue;
        }

        let exe_inside = summary
            .exe
            .as_ref()
            .is_some_and(|exe| path::covers(&target_str, &exe.to_string_lossy()));
        let reason = if exe_inside {
            "executable is inside target"
        } else if path::comparison_key(&summary.command_line).contains(&needle) {
            "command line mentions target"
        } else {
            continue;
        };

        suspects.push(Suspect {
            process_id: summary.pid,
            process_name: summary.name.clone(),
            reason: reason.to_string(),
        });
    }

    suspects
}
