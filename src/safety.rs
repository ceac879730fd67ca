use std::env;
use std::path::{Path, PathBuf};

use crate::path;

/// Denylist of locations that must never be deleted or moved.
///
/// A target is protected if it equals an entry, if it contains an entry
/// (removing `C:\` would remove `C:\Windows`), or if it is a filesystem root.
#[derive(Debug, Clone)]
pub struct ProtectedPaths {
    entries: Vec<PathBuf>,
}

impl ProtectedPaths {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn system_defaults() -> Self {
        let mut protected = Self::empty();

        #[cfg(windows)]
        {
            let system_drive = env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
            let windir = env::var("SystemRoot")
                .or_else(|_| env::var("windir"))
                .unwrap_or_else(|_| format!("{}\\Windows", system_drive));

            protected.push(&windir);
            protected.push(format!("{}\\System32", windir));
            protected.push(format!("{}\\SysWOW64", windir));
            for var in ["ProgramFiles", "ProgramFiles(x86)", "ProgramW6432", "ProgramData"] {
                if let Ok(value) = env::var(var) {
                    protected.push(value);
                }
            }
            protected.push(format!("{}\\Program Files", system_drive));
            protected.push(format!("{}\\Program Files (x86)", system_drive));
            protected.push(format!("{}\\ProgramData", system_drive));
            protected.push(format!("{}\\Users", system_drive));
            protected.push(format!("{}\\", system_drive));
            if let Ok(profile) = env::var("USERPROFILE") {
                protected.push(profile);
            }
        }

        #[cfg(unix)]
        {
            for entry in [
                "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin",
                "/sys", "/usr", "/var",
            ] {
                protected.push(entry);
            }
        }

        if let Ok(home) = env::var("HOME") {
            protected.push(home);
        }

        protected
    }

    pub fn push(&mut self, entry: impl AsRef<Path>) {
        let entry = path::normalize(entry.as_ref());
        if entry.as_os_str().is_empty() {
            return;
        }
        let key = path::comparison_key(&entry.to_string_lossy());
        let already = self
            .entries
            .iter()
            .any(|e| path::comparison_key(&e.to_string_lossy()) == key);
        if !already {
            self.entries.push(entry);
        }
    }

    pub fn with(mut self, entry: impl AsRef<Path>) -> Self {
        self.push(entry);
        self
    }

    pub fn extend<I, P>(&mut self, entries: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for entry in entries {
            self.push(entry);
        }
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Returns the denylist entry `target` collides with, if any: the entry
    /// itself or one of its ancestors. Paths below an entry are not protected.
    pub fn check(&self, target: &Path) -> Option<PathBuf> {
        let normalized = path::normalize(target);
        let mut forms = vec![normalized.to_string_lossy().into_owned()];
        if let Ok(canonical) = normalized.canonicalize() {
            forms.push(canonical.to_string_lossy().into_owned());
        }

        if is_filesystem_root(&normalized) {
            return Some(normalized);
        }

        for entry in &self.entries {
            let entry_str = entry.to_string_lossy();
            for form in &forms {
                let same = path::comparison_key(form) == path::comparison_key(&entry_str);
                if same || path::is_within(&entry_str, form) {
                    return Some(entry.clone());
                }
            }
        }

        None
    }

    pub fn is_protected(&self, target: &Path) -> bool {
        self.check(target).is_some()
    }
}

impl Default for ProtectedPaths {
    fn default() -> Self {
        Self::system_defaults()
    }
}

fn is_filesystem_root(path: &Path) -> bool {
    path.has_root() && path.parent().is_none()
}
