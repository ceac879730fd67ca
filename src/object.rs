//! Name and type queries on kernel objects.
//!
//! Both queries return a buffer that starts with a `UNICODE_STRING` whose
//! `Buffer` points back into the same allocation.

#[cfg(windows)]
use windows::Win32::Foundation::HANDLE;
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{GetFileType, FILE_TYPE_DISK};

#[cfg(windows)]
use crate::handle::OwnedHandle;
#[cfg(windows)]
use crate::handle_table::{query_with_growth, QueryStatus};
#[cfg(windows)]
use crate::ntdll;
#[cfg(windows)]
use crate::path::DeviceMap;

const PTR: usize = std::mem::size_of::<usize>();
#[cfg(windows)]
const OBJECT_QUERY_BUFFER: usize = 1024;
#[cfg(windows)]
const OBJECT_QUERY_ATTEMPTS: u32 = 3;

/// Decodes the length-prefixed wide string at the start of `buffer`.
///
/// `None` when the length is zero, the pointer is null, or the string would
/// run outside the buffer.
pub fn decode_unicode_string(buffer: &[u8]) -> Option<String> {
    if buffer.len() < 2 * PTR {
        return None;
    }

    let length = u16::from_ne_bytes([buffer[0], buffer[1]]) as usize;
    if length == 0 || length % 2 != 0 {
        return None;
    }

    let mut ptr_bytes = [0u8; PTR];
    ptr_bytes.copy_from_slice(&buffer[PTR..2 * PTR]);
    let ptr = usize::from_ne_bytes(ptr_bytes);
    if ptr == 0 {
        return None;
    }

    let offset = ptr.checked_sub(buffer.as_ptr() as usize)?;
    let end = offset.checked_add(length)?;
    let bytes = buffer.get(offset..end)?;

    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&wide))
}

#[cfg(windows)]
fn query_object(handle: HANDLE, class: u32) -> Option<Vec<u8>> {
    query_with_growth(OBJECT_QUERY_BUFFER, OBJECT_QUERY_ATTEMPTS, |buf| {
        let mut required: u32 = 0;
        let status = unsafe {
            ntdll::NtQueryObject(
                handle,
                class,
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut required,
            )
        };
        QueryStatus::from_ntstatus(status.0, required as usize)
    })
    .ok()
}

/// Kernel name of the object behind `handle`, in device-namespace form.
/// `None` for unnamed objects.
#[cfg(windows)]
pub fn object_name(handle: HANDLE) -> Option<String> {
    let buffer = query_object(handle, ntdll::OBJECT_NAME_INFORMATION)?;
    decode_unicode_string(&buffer)
}

/// Type name of the object behind `handle` ("File", "Section", ...).
#[cfg(windows)]
pub fn type_name(handle: HANDLE) -> Option<String> {
    let buffer = query_object(handle, ntdll::OBJECT_TYPE_INFORMATION)?;
    decode_unicode_string(&buffer)
}

/// Backing path of a duplicated handle, translated to drive-letter form.
#[cfg(windows)]
pub fn resolve_name(handle: &OwnedHandle, devices: &DeviceMap) -> Option<String> {
    let raw = object_name(handle.raw())?;
    Some(devices.to_normal(&raw))
}

/// Pipes, consoles and character devices are skipped before any name query.
#[cfg(windows)]
pub fn is_disk_file(handle: &OwnedHandle) -> bool {
    unsafe { GetFileType(handle.raw()) == FILE_TYPE_DISK }
}
