//! Primary discovery: ask Restart Manager who is using a file.
//!
//! Restart Manager reports processes, not handles. Hits from here carry
//! identity only; closing anything still needs the handle table.

use std::io;
use std::path::Path;

use crate::inventory::ProcessEntry;

#[cfg(windows)]
use windows::core::{PCWSTR, PWSTR};
#[cfg(windows)]
use windows::Win32::Foundation::{ERROR_MORE_DATA, WIN32_ERROR};
#[cfg(windows)]
use windows::Win32::System::RestartManager::{
    RmEndSession, RmGetList, RmRegisterResources, RmStartSession, CCH_RM_SESSION_KEY,
    RM_PROCESS_INFO,
};

#[cfg(windows)]
use crate::winapi::path_to_wide;

// Processes can start using the file between the size query and the fetch.
#[cfg(windows)]
const MAX_LIST_ATTEMPTS: u32 = 3;

#[cfg(windows)]
fn check(result: WIN32_ERROR) -> io::Result<()> {
    if result == WIN32_ERROR(0) {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(result.0 as i32))
    }
}

/// A Restart Manager session, ended when dropped.
#[cfg(windows)]
struct RmSession(u32);

#[cfg(windows)]
impl RmSession {
    fn start() -> io::Result<Self> {
        let mut handle: u32 = 0;
        let mut key = [0u16; CCH_RM_SESSION_KEY as usize + 1];
        check(unsafe { RmStartSession(&mut handle, 0, PWSTR(key.as_mut_ptr())) })?;
        Ok(Self(handle))
    }

    fn register_file(&self, path: &Path) -> io::Result<()> {
        let wide = path_to_wide(path);
        let files = [PCWSTR(wide.as_ptr())];
        check(unsafe { RmRegisterResources(self.0, Some(&files), None, None) })
    }

    fn list(&self) -> io::Result<Vec<ProcessEntry>> {
        let mut needed: u32 = 0;
        let mut count: u32 = 0;
        let mut reasons: u32 = 0;

        let result = unsafe { RmGetList(self.0, &mut needed, &mut count, None, &mut reasons) };
        if result != ERROR_MORE_DATA {
            check(result)?;
        }

        for _ in 0..MAX_LIST_ATTEMPTS {
            if needed == 0 {
                return Ok(Vec::new());
            }

            let mut infos: Vec<RM_PROCESS_INFO> =
                vec![unsafe { std::mem::zeroed() }; needed as usize];
            count = needed;

            let result = unsafe {
                RmGetList(
                    self.0,
                    &mut needed,
                    &mut count,
                    Some(infos.as_mut_ptr()),
                    &mut reasons,
                )
            };
            if result == ERROR_MORE_DATA {
                continue;
            }
            check(result)?;

            infos.truncate(count as usize);
            return Ok(infos.iter().map(entry_from_info).collect());
        }

        Err(io::Error::from_raw_os_error(ERROR_MORE_DATA.0 as i32))
    }
}

#[cfg(windows)]
impl Drop for RmSession {
    fn drop(&mut self) {
        unsafe {
            let _ = RmEndSession(self.0);
        }
    }
}

#[cfg(windows)]
fn entry_from_info(info: &RM_PROCESS_INFO) -> ProcessEntry {
    let len = info
        .strAppName
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(info.strAppName.len());
    ProcessEntry {
        pid: info.Process.dwProcessId,
        name: String::from_utf16_lossy(&info.strAppName[..len]),
    }
}

/// Processes currently using `file`. An empty list means nobody is.
#[cfg(windows)]
pub fn query(file: &Path) -> io::Result<Vec<ProcessEntry>> {
    let session = RmSession::start()?;
    session.register_file(file)?;
    session.list()
}

#[cfg(not(windows))]
pub fn query(_file: &Path) -> io::Result<Vec<ProcessEntry>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Restart Manager is not available on this platform",
    ))
}
