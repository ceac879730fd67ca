//! Scope-guarded kernel handles.
//!
//! A handle value read from the system handle table only means something
//! inside the process that owns it. Duplicating it into this process gives
//! us exactly one reference of our own, held by [`OwnedHandle`] and closed
//! when it drops, on every path.

use std::io;

#[cfg(windows)]
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_CLOSE_SOURCE, DUPLICATE_SAME_ACCESS, HANDLE,
};
#[cfg(windows)]
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, PROCESS_ACCESS_RIGHTS, PROCESS_DUP_HANDLE,
};

#[cfg(windows)]
pub struct OwnedHandle(HANDLE);

#[cfg(windows)]
impl OwnedHandle {
    /// Takes ownership of `handle`; `None` for null or pseudo-invalid values.
    pub fn new(handle: HANDLE) -> Option<Self> {
        if handle.is_invalid() {
            None
        } else {
            Some(Self(handle))
        }
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

#[cfg(windows)]
impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

#[cfg(windows)]
impl std::fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnedHandle({:#x})", self.0 .0 as usize)
    }
}

#[cfg(windows)]
pub fn open_process(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Option<OwnedHandle> {
    unsafe { OpenProcess(access, false, pid) }
        .ok()
        .and_then(OwnedHandle::new)
}

/// Per-pass cache of duplicate-capable process handles, so a process with
/// thousands of handles is opened once. Failed opens are remembered too.
#[cfg(windows)]
#[derive(Default)]
pub struct ProcessHandleCache {
    handles: std::collections::HashMap<u32, Option<OwnedHandle>>,
}

#[cfg(windows)]
impl ProcessHandleCache {
    pub fn get(&mut self, pid: u32) -> Option<&OwnedHandle> {
        self.handles
            .entry(pid)
            .or_insert_with(|| open_process(pid, PROCESS_DUP_HANDLE))
            .as_ref()
    }
}

/// Duplicates `remote_value` out of `process` into this process with the
/// same access it has in the owner.
#[cfg(windows)]
pub fn duplicate_from(process: &OwnedHandle, remote_value: usize) -> Option<OwnedHandle> {
    let mut local = HANDLE::default();
    let result = unsafe {
        DuplicateHandle(
            process.raw(),
            HANDLE(remote_value as *mut _),
            GetCurrentProcess(),
            &mut local,
            0,
            false,
            DUPLICATE_SAME_ACCESS,
        )
    };
    result.ok()?;
    OwnedHandle::new(local)
}

/// Closes `remote_value` inside process `owner_pid`.
///
/// Duplication with `DUPLICATE_CLOSE_SOURCE` closes the source handle in the
/// owner atomically; the zero-access copy we receive is dropped immediately.
#[cfg(windows)]
pub fn close_remote(owner_pid: u32, remote_value: usize) -> io::Result<()> {
    let process = open_process(owner_pid, PROCESS_DUP_HANDLE)
        .ok_or_else(io::Error::last_os_error)?;

    let mut local = HANDLE::default();
    unsafe {
        DuplicateHandle(
            process.raw(),
            HANDLE(remote_value as *mut _),
            GetCurrentProcess(),
            &mut local,
            0,
            false,
            DUPLICATE_CLOSE_SOURCE,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e.code().0 & 0xFFFF))?;

    drop(OwnedHandle::new(local));
    Ok(())
}

#[cfg(not(windows))]
pub fn close_remote(_owner_pid: u32, _remote_value: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "closing foreign handles is not supported on this platform",
    ))
}

/// A handle that lives in a foreign process, plus (when we could take one)
/// our own duplicated reference to the same object.
///
/// Never outlives the inventory pass that produced it: foreign handles can
/// be closed or recycled at any time.
pub struct BorrowedHandle {
    owner_pid: u32,
    remote_value: usize,
    /// Keeps the object alive until the record is dropped.
    #[cfg(windows)]
    _local: Option<OwnedHandle>,
}

impl BorrowedHandle {
    #[cfg(windows)]
    pub fn new(owner_pid: u32, remote_value: usize, local: OwnedHandle) -> Self {
        Self {
            owner_pid,
            remote_value,
            _local: Some(local),
        }
    }

    /// A reference to a foreign handle we hold no duplicate of.
    pub fn detached(owner_pid: u32, remote_value: usize) -> Self {
        Self {
            owner_pid,
            remote_value,
            #[cfg(windows)]
            _local: None,
        }
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn remote_value(&self) -> usize {
        self.remote_value
    }
}

impl std::fmt::Debug for BorrowedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BorrowedHandle")
            .field("owner_pid", &self.owner_pid)
            .field("remote_value", &format_args!("{:#x}", self.remote_value))
            .finish()
    }
}
