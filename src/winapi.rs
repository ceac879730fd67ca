//! Filesystem primitives used once a path has been unlocked.

use std::io;
use std::path::Path;
#[cfg(windows)]
use std::thread;
#[cfg(windows)]
use std::time::Duration;

#[cfg(windows)]
use windows::core::PCWSTR;
#[cfg(windows)]
use windows::Wdk::Storage::FileSystem::{
    FILE_DISPOSITION_DELETE, FILE_DISPOSITION_IGNORE_READONLY_ATTRIBUTE,
    FILE_DISPOSITION_INFORMATION_EX, FILE_DISPOSITION_INFORMATION_EX_FLAGS,
    FILE_DISPOSITION_POSIX_SEMANTICS,
};
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE};
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FileDispositionInfoEx, FindClose, FindFirstFileExW, FindNextFileW,
    GetFileAttributesW, MoveFileExW, SetFileAttributesW, SetFileInformationByHandle, DELETE,
    FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_ATTRIBUTE_REPARSE_POINT,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, FINDEX_INFO_LEVELS, FINDEX_SEARCH_OPS,
    FIND_FIRST_EX_FLAGS, INVALID_FILE_ATTRIBUTES, MOVEFILE_DELAY_UNTIL_REBOOT,
    MOVE_FILE_FLAGS, OPEN_EXISTING, WIN32_FIND_DATAW,
};

/// Pauses between attempts at deleting an entry another process is releasing.
#[cfg(windows)]
const RETRY_DELAYS_MS: [u64; 5] = [0, 50, 100, 200, 500];

#[cfg(windows)]
fn win32_error(e: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(e.code().0 & 0xFFFF)
}

/// Attributes of `path`, falling back to a directory search for entries
/// `GetFileAttributesW` refuses (pending deletes, some reparse points).
#[cfg(windows)]
fn attributes(path: &Path) -> Option<u32> {
    let wide_path = path_to_wide(path);
    let attrs = unsafe { GetFileAttributesW(PCWSTR(wide_path.as_ptr())) };
    if attrs != INVALID_FILE_ATTRIBUTES {
        return Some(attrs);
    }

    unsafe {
        let mut find_data: WIN32_FIND_DATAW = std::mem::zeroed();
        let handle = FindFirstFileExW(
            PCWSTR(wide_path.as_ptr()),
            FINDEX_INFO_LEVELS(0),
            &mut find_data as *mut _ as *mut _,
            FINDEX_SEARCH_OPS(0),
            None,
            FIND_FIRST_EX_FLAGS(0),
        )
        .ok()?;
        let _ = FindClose(handle);
        Some(find_data.dwFileAttributes)
    }
}

#[cfg(windows)]
pub fn path_exists(path: &Path) -> bool {
    attributes(path).is_some()
}

#[cfg(windows)]
pub fn is_directory(path: &Path) -> bool {
    attributes(path).is_some_and(|attrs| attrs & FILE_ATTRIBUTE_DIRECTORY.0 != 0)
}

#[cfg(not(windows))]
pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(not(windows))]
pub fn is_directory(path: &Path) -> bool {
    path.is_dir()
}

/// Wide, NUL-terminated form of `path`, with the `\\?\` prefix on absolute
/// drive paths so long paths work.
#[cfg(windows)]
pub(crate) fn path_to_wide(path: &Path) -> Vec<u16> {
    let normalized = path.to_string_lossy().replace('/', "\\");

    let is_drive_absolute = normalized.len() >= 3
        && normalized.chars().nth(1) == Some(':')
        && normalized.chars().nth(2) == Some('\\');

    let prefixed = if is_drive_absolute {
        format!(r"\\?\{}", normalized)
    } else {
        normalized
    };
    prefixed.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Sharing and lock violations clear up once the holder lets go; access
/// denied is what a handle in delete-pending state reports.
#[cfg(windows)]
fn is_transient(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(5) | Some(32) | Some(33))
}

#[cfg(windows)]
fn with_retries(path: &Path, is_dir: bool) -> io::Result<()> {
    let wide_path = path_to_wide(path);
    let mut last_error = None;

    for delay_ms in RETRY_DELAYS_MS {
        if delay_ms > 0 && last_error.is_some() {
            thread::sleep(Duration::from_millis(delay_ms));
        }
        match unsafe { posix_delete(&wide_path, is_dir) } {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::other("delete retries exhausted")))
}

#[cfg(windows)]
pub fn delete_file(path: &Path) -> io::Result<()> {
    with_retries(path, false)
}

#[cfg(windows)]
pub fn remove_dir(path: &Path) -> io::Result<()> {
    with_retries(path, true)
}

/// Marks the entry for deletion with POSIX semantics: the name disappears
/// as soon as our handle closes, even if others still have it open.
#[cfg(windows)]
unsafe fn posix_delete(wide_path: &[u16], is_dir: bool) -> io::Result<()> {
    let mut open_flags = FILE_FLAG_OPEN_REPARSE_POINT;
    let mut disposition = FILE_DISPOSITION_DELETE.0 | FILE_DISPOSITION_POSIX_SEMANTICS.0;
    if is_dir {
        open_flags |= FILE_FLAG_BACKUP_SEMANTICS;
    } else {
        disposition |= FILE_DISPOSITION_IGNORE_READONLY_ATTRIBUTE.0;
    }

    let handle = CreateFileW(
        PCWSTR(wide_path.as_ptr()),
        DELETE.0,
        FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
        None,
        OPEN_EXISTING,
        open_flags,
        HANDLE::default(),
    )
    .map_err(win32_error)?;

    let mut info = FILE_DISPOSITION_INFORMATION_EX {
        Flags: FILE_DISPOSITION_INFORMATION_EX_FLAGS(disposition),
    };
    let result = SetFileInformationByHandle(
        handle,
        FileDispositionInfoEx,
        &mut info as *mut _ as *mut _,
        std::mem::size_of::<FILE_DISPOSITION_INFORMATION_EX>() as u32,
    );
    let _ = CloseHandle(handle);

    result.map_err(win32_error)
}

#[cfg(not(windows))]
pub fn delete_file(path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)
}

#[cfg(not(windows))]
pub fn remove_dir(path: &Path) -> io::Result<()> {
    std::fs::remove_dir(path)
}

/// One directory entry as seen by [`enumerate_files`].
pub struct FileEntry {
    pub path: std::path::PathBuf,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
}

#[cfg(windows)]
fn entry_from_find_data(dir: &Path, data: &WIN32_FIND_DATAW) -> Option<FileEntry> {
    let len = data.cFileName.iter().position(|&c| c == 0).unwrap_or(data.cFileName.len());
    let name = String::from_utf16_lossy(&data.cFileName[..len]);
    if name == "." || name == ".." {
        return None;
    }

    let attrs = data.dwFileAttributes;
    let is_dir = attrs & FILE_ATTRIBUTE_DIRECTORY.0 != 0;
    Some(FileEntry {
        path: dir.join(name),
        is_dir,
        is_symlink: attrs & FILE_ATTRIBUTE_REPARSE_POINT.0 != 0,
        size: if is_dir {
            0
        } else {
            (u64::from(data.nFileSizeHigh) << 32) | u64::from(data.nFileSizeLow)
        },
    })
}

/// Calls `callback` for every entry of `dir`, without following reparse
/// points. A directory that vanished mid-walk yields nothing.
#[cfg(windows)]
pub fn enumerate_files<F>(dir: &Path, mut callback: F) -> io::Result<()>
where
    F: FnMut(FileEntry) -> io::Result<()>,
{
    let pattern = path_to_wide(&dir.join("*"));
    let mut data: WIN32_FIND_DATAW = unsafe { std::mem::zeroed() };

    // FindExInfoBasic skips the 8.3 short name lookup.
    let search = unsafe {
        FindFirstFileExW(
            PCWSTR(pattern.as_ptr()),
            FINDEX_INFO_LEVELS(1),
            &mut data as *mut _ as *mut _,
            FINDEX_SEARCH_OPS(0),
            None,
            FIND_FIRST_EX_FLAGS(0),
        )
    };
    let handle = match search.map_err(win32_error) {
        Ok(handle) => handle,
        Err(e) if is_not_found_error(&e) => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut result = Ok(());
    loop {
        if let Some(entry) = entry_from_find_data(dir, &data) {
            result = callback(entry);
            if result.is_err() {
                break;
            }
        }
        if unsafe { FindNextFileW(handle, &mut data) }.is_err() {
            break;
        }
    }

    unsafe {
        let _ = FindClose(handle);
    }
    result
}

#[cfg(not(windows))]
pub fn enumerate_files<F>(dir: &Path, mut callback: F) -> io::Result<()>
where
    F: FnMut(FileEntry) -> io::Result<()>,
{
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let is_dir = file_type.is_dir();
        let is_symlink = file_type.is_symlink();
        let size = if is_dir || is_symlink {
            0
        } else {
            entry.metadata().map(|m| m.len()).unwrap_or(0)
        };
        callback(FileEntry {
            path,
            is_dir,
            is_symlink,
            size,
        })?;
    }
    Ok(())
}

/// Drops read-only, hidden and system attributes so the entry can be removed.
#[cfg(windows)]
pub fn clear_attributes(path: &Path) -> io::Result<()> {
    let wide_path = path_to_wide(path);
    unsafe { SetFileAttributesW(PCWSTR(wide_path.as_ptr()), FILE_ATTRIBUTE_NORMAL) }
        .map_err(win32_error)
}

#[cfg(not(windows))]
pub fn clear_attributes(path: &Path) -> io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

/// Renames `from` to `to` on the same volume. Fails with a cross-device
/// error (see [`is_cross_device_error`]) rather than copying.
#[cfg(windows)]
pub fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    let wide_from = path_to_wide(from);
    let wide_to = path_to_wide(to);
    unsafe {
        MoveFileExW(
            PCWSTR(wide_from.as_ptr()),
            PCWSTR(wide_to.as_ptr()),
            MOVE_FILE_FLAGS(0),
        )
    }
    .map_err(win32_error)
}

#[cfg(not(windows))]
pub fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::rename(from, to)
}

/// Registers `path` for removal at the next boot. Directories must be
/// empty by then, so callers register children first.
#[cfg(windows)]
pub fn schedule_delete_on_reboot(path: &Path) -> io::Result<()> {
    let wide_path = path_to_wide(path);
    unsafe {
        MoveFileExW(
            PCWSTR(wide_path.as_ptr()),
            PCWSTR::null(),
            MOVEFILE_DELAY_UNTIL_REBOOT,
        )
    }
    .map_err(win32_error)
}

#[cfg(not(windows))]
pub fn schedule_delete_on_reboot(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "delete-on-reboot is not supported on this platform",
    ))
}

/// True when a rename failed only because source and destination are on
/// different volumes.
pub fn is_cross_device_error(error: &io::Error) -> bool {
    #[cfg(windows)]
    const NOT_SAME_DEVICE: i32 = 17; // ERROR_NOT_SAME_DEVICE
    #[cfg(not(windows))]
    const NOT_SAME_DEVICE: i32 = 18; // EXDEV
    error.raw_os_error() == Some(NOT_SAME_DEVICE)
}

/// Check if an error indicates the file/directory no longer exists
pub fn is_not_found_error(error: &io::Error) -> bool {
    #[cfg(windows)]
    {
        const ERROR_FILE_NOT_FOUND: i32 = 2;
        const ERROR_PATH_NOT_FOUND: i32 = 3;
        const ERROR_INVALID_NAME: i32 = 123;
        const ERROR_BAD_PATHNAME: i32 = 161;

        if let Some(code) = error.raw_os_error() {
            if matches!(
                code,
                ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND | ERROR_INVALID_NAME | ERROR_BAD_PATHNAME
            ) {
                return true;
            }
        }
    }

    error.kind() == io::ErrorKind::NotFound
}
