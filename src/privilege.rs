//! Token privileges needed to open and duplicate other processes' handles.

pub const DEBUG: &str = "SeDebugPrivilege";
pub const BACKUP: &str = "SeBackupPrivilege";
pub const RESTORE: &str = "SeRestorePrivilege";

/// Enables `name` on this process's token. Safe to call repeatedly.
///
/// `false` when the token does not hold the privilege at all, which is the
/// normal case for a non-elevated caller.
#[cfg(windows)]
pub fn enable(name: &str) -> bool {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{GetLastError, HANDLE, LUID};
    use windows::Win32::Security::{
        AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    use crate::handle::OwnedHandle;

    const ERROR_NOT_ALL_ASSIGNED: u32 = 1300;

    let mut token = HANDLE::default();
    if unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )
    }
    .is_err()
    {
        return false;
    }
    let Some(token) = OwnedHandle::new(token) else {
        return false;
    };

    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
    let mut luid = LUID::default();
    if unsafe { LookupPrivilegeValueW(PCWSTR::null(), PCWSTR(wide.as_ptr()), &mut luid) }.is_err()
    {
        return false;
    }

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };

    if unsafe { AdjustTokenPrivileges(token.raw(), false, Some(&privileges), 0, None, None) }
        .is_err()
    {
        return false;
    }

    // AdjustTokenPrivileges succeeds even when nothing was assigned.
    unsafe { GetLastError() }.0 != ERROR_NOT_ALL_ASSIGNED
}

#[cfg(not(windows))]
pub fn enable(_name: &str) -> bool {
    false
}

/// Enables the privileges the scanners use. Returns the names that could not be enabled.
pub fn enable_scan_privileges() -> Vec<&'static str> {
    [DEBUG, BACKUP, RESTORE]
        .into_iter()
        .filter(|name| !enable(name))
        .collect()
}
