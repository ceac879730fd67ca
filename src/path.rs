//! Path canonicalization and comparison.
//!
//! Kernel objects report their names in device-namespace form
//! (`\Device\HarddiskVolume3\...`), Restart Manager and the shell use drive
//! letters, and users type whatever they like. Everything is funnelled through
//! here before two paths are compared.

use std::path::{Component, Path, PathBuf};

#[cfg(windows)]
use windows::core::PCWSTR;
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{GetLogicalDriveStringsW, QueryDosDeviceW};

const VERBATIM_UNC_PREFIX: &str = r"\\?\UNC\";
const VERBATIM_PREFIX: &str = r"\\?\";
const NT_UNC_PREFIX: &str = r"\??\UNC\";
const NT_PREFIX: &str = r"\??\";
const MUP_PREFIX: &str = r"\Device\Mup\";

/// Resolves `path` to an absolute form and strips trailing separators.
///
/// Returns the input unchanged if it cannot be made absolute. Success does
/// not imply the path is valid; use [`is_valid`] for that.
pub fn normalize(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return path.to_path_buf();
    }

    let absolute = match std::path::absolute(path) {
        Ok(p) => p,
        Err(_) => return path.to_path_buf(),
    };

    let text = absolute.to_string_lossy();
    let trimmed = trim_trailing_separators(&text);
    PathBuf::from(trimmed)
}

fn trim_trailing_separators(text: &str) -> &str {
    let mut end = text.len();
    while end > 0 {
        let candidate = &text[..end];
        let last = candidate.as_bytes()[end - 1];
        if last != b'\\' && last != b'/' {
            break;
        }
        // Keep the separator of a root ("C:\", "/", "\\?\C:\").
        let without = &candidate[..end - 1];
        if without.is_empty() || without.ends_with(':') || without.ends_with('?') {
            break;
        }
        end -= 1;
    }
    &text[..end]
}

/// Rejects empty or whitespace input, `..` segments, and paths whose root is
/// not rooted or does not resolve.
pub fn is_valid(path: &Path) -> bool {
    let text = path.to_string_lossy();
    if text.trim().is_empty() {
        return false;
    }

    if has_parent_segments(path) {
        return false;
    }

    if !path.has_root() {
        return false;
    }

    match path.ancestors().last() {
        Some(root) => root.exists(),
        None => false,
    }
}

/// True if any segment of `path` is `..`, whichever separator it uses.
pub fn has_parent_segments(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
        || path
            .to_string_lossy()
            .split(['\\', '/'])
            .any(|segment| segment == "..")
}

/// Snapshot of the drive-letter to device-name table (`C:` -> `\Device\HarddiskVolume3`).
///
/// Built once per inventory pass; drive mappings can change between passes.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    entries: Vec<(String, String)>,
}

impl DeviceMap {
    pub fn from_entries<I, D, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (D, T)>,
        D: Into<String>,
        T: Into<String>,
    {
        let mut entries: Vec<(String, String)> = entries
            .into_iter()
            .map(|(drive, device)| (drive.into(), device.into()))
            .collect();
        // Longest device first so `\Device\HarddiskVolume10` beats `...Volume1`.
        entries.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        Self { entries }
    }

    #[cfg(windows)]
    pub fn load() -> Self {
        let mut buffer = [0u16; 512];
        let len = unsafe { GetLogicalDriveStringsW(Some(&mut buffer)) } as usize;
        if len == 0 || len > buffer.len() {
            tracing::warn!("GetLogicalDriveStringsW returned {}", len);
            return Self::default();
        }

        let drives = String::from_utf16_lossy(&buffer[..len]);
        let mut entries = Vec::new();

        for root in drives.split('\0').filter(|s| !s.is_empty()) {
            let drive = root.trim_end_matches('\\');
            let wide: Vec<u16> = drive.encode_utf16().chain(std::iter::once(0)).collect();
            let mut target = [0u16; 1024];
            let written = unsafe { QueryDosDeviceW(PCWSTR(wide.as_ptr()), Some(&mut target)) };
            if written == 0 {
                continue;
            }
            // The target is a multi-string; only the first entry is the active mapping.
            let first_len = target
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(written as usize);
            let device = String::from_utf16_lossy(&target[..first_len]);
            if !device.is_empty() {
                entries.push((drive.to_string(), device));
            }
        }

        Self::from_entries(entries)
    }

    #[cfg(not(windows))]
    pub fn load() -> Self {
        Self::default()
    }

    /// Translates a device-namespace path to drive-letter form. Inputs that
    /// cannot be resolved are returned unchanged.
    pub fn to_normal(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix(NT_UNC_PREFIX) {
            return format!(r"\\{}", rest);
        }
        if let Some(rest) = path.strip_prefix(NT_PREFIX) {
            return rest.to_string();
        }
        if let Some(rest) = strip_prefix_ignore_case(path, MUP_PREFIX) {
            return format!(r"\\{}", rest);
        }

        for (drive, device) in &self.entries {
            if let Some(rest) = strip_prefix_ignore_case(path, device) {
                if rest.is_empty() {
                    return format!("{}\\", drive);
                }
                if rest.starts_with('\\') {
                    return format!("{}{}", drive, rest);
                }
            }
        }

        path.to_string()
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// One-shot translation of a device-namespace path; loads the device table
/// on every call, so scanners should hold a [`DeviceMap`] instead.
pub fn device_path_to_normal(path: &str) -> String {
    if !path.starts_with('\\') || path.starts_with(VERBATIM_PREFIX) || path.starts_with(r"\\") {
        return path.to_string();
    }
    DeviceMap::load().to_normal(path)
}

/// Lexical comparison key: verbatim prefixes removed, separators unified,
/// trailing separators dropped, lowercased.
pub fn comparison_key(path: &str) -> String {
    let stripped = if let Some(rest) = path.strip_prefix(VERBATIM_UNC_PREFIX) {
        format!(r"\\{}", rest)
    } else if let Some(rest) = path.strip_prefix(VERBATIM_PREFIX) {
        rest.to_string()
    } else {
        path.to_string()
    };

    let unified = stripped.replace('/', "\\");
    trim_trailing_separators(&unified).to_lowercase()
}

/// True if `a` and `b` name the same path or one is a separator-bounded
/// ancestor of the other. Case-insensitive.
pub fn matches(a: &str, b: &str) -> bool {
    let a = comparison_key(a);
    let b = comparison_key(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || is_ancestor_key(&a, &b) || is_ancestor_key(&b, &a)
}

/// True if `candidate` is `target` itself or lies inside it. Used to decide
/// whether a reference reported by the kernel pins the target.
pub fn covers(target: &str, candidate: &str) -> bool {
    let t = comparison_key(target);
    let c = comparison_key(candidate);
    !t.is_empty() && (t == c || is_ancestor_key(&t, &c))
}

/// True if `descendant` lies strictly inside `ancestor`.
pub fn is_within(descendant: &str, ancestor: &str) -> bool {
    let d = comparison_key(descendant);
    let a = comparison_key(ancestor);
    !a.is_empty() && is_ancestor_key(&a, &d)
}

fn is_ancestor_key(ancestor: &str, descendant: &str) -> bool {
    if descendant.len() <= ancestor.len() || !descendant.starts_with(ancestor) {
        return false;
    }
    // A root key already ends in a separator ("c:\" after trimming keeps it).
    ancestor.ends_with('\\') || descendant.as_bytes()[ancestor.len()] == b'\\'
}
