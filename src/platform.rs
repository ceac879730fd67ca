//! The operating-system services the unlock pipeline depends on.
//!
//! [`NativePlatform`] binds them to the real OS. The orchestrator only
//! talks to [`Platform`], so its policy can be driven by a scripted double.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FailedItem;
use crate::handle::{self, BorrowedHandle};
use crate::handle_table::{self, HandleEntry, TableError};
use crate::inventory::{LockRecord, ProcessEntry, Suspect};
use crate::process::{self, ProcessTable};
use crate::{cwd, privilege, restart, section, unlock, winapi};

pub trait Platform {
    /// Brackets one inventory pass. Scans between the two calls may share
    /// system snapshots.
    fn begin_pass(&self) {}

    fn end_pass(&self) {}

    /// Restart Manager users of one file. `Err` sends the whole pass to the
    /// handle-table fallback.
    fn query_managed(&self, file: &Path) -> io::Result<Vec<ProcessEntry>>;

    /// Open file handles on `target` or below, optionally only in `owners`.
    fn scan_handle_table(
        &self,
        target: &Path,
        owners: Option<&[u32]>,
    ) -> Result<Vec<LockRecord>, TableError>;

    fn scan_mapped_sections(&self, target: &Path) -> Vec<LockRecord>;

    fn scan_working_directories(&self, target: &Path) -> Vec<LockRecord>;

    fn command_line_suspects(&self, target: &Path) -> Vec<Suspect>;

    /// Closes the foreign handle inside its owner.
    fn close_handle(&self, handle: &BorrowedHandle) -> io::Result<()>;

    fn terminate(&self, pid: u32) -> bool;

    /// Deletes `target` recursively, reporting every entry that stayed.
    fn remove_tree(&self, target: &Path) -> Result<(), Vec<FailedItem>> {
        unlock::remove_tree(target)
    }

    fn schedule_delete_on_reboot(&self, path: &Path) -> io::Result<()> {
        winapi::schedule_delete_on_reboot(path)
    }

    /// Gives the filesystem time to notice closed handles and exited processes.
    fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Snapshots taken at most once per inventory pass.
#[derive(Default)]
struct PassSnapshots {
    processes: Option<Arc<ProcessTable>>,
    handles: Option<Arc<Vec<HandleEntry>>>,
}

pub struct NativePlatform {
    pass: Mutex<Option<PassSnapshots>>,
}

impl NativePlatform {
    /// Enables the debug and backup privileges. Missing privileges only
    /// narrow what can be seen, so failure is logged and ignored.
    pub fn new() -> Self {
        let missing = privilege::enable_scan_privileges();
        if !missing.is_empty() {
            tracing::warn!(
                ?missing,
                "running without some privileges; handles of other users' processes may be missed"
            );
        }
        Self {
            pass: Mutex::new(None),
        }
    }

    /// The running processes; shared within a pass, fresh outside one.
    fn processes(&self) -> Arc<ProcessTable> {
        let mut pass = self.pass.lock();
        match pass.as_mut() {
            Some(snapshots) => snapshots
                .processes
                .get_or_insert_with(|| Arc::new(ProcessTable::snapshot()))
                .clone(),
            None => Arc::new(ProcessTable::snapshot()),
        }
    }

    /// The system handle table. A failed query is not cached.
    fn handles(&self) -> Result<Arc<Vec<HandleEntry>>, TableError> {
        let mut pass = self.pass.lock();
        let Some(snapshots) = pass.as_mut() else {
            return handle_table::snapshot().map(Arc::new);
        };
        if let Some(handles) = &snapshots.handles {
            return Ok(Arc::clone(handles));
        }
        let handles = Arc::new(handle_table::snapshot()?);
        snapshots.handles = Some(Arc::clone(&handles));
        Ok(handles)
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for NativePlatform {
    fn begin_pass(&self) {
        *self.pass.lock() = Some(PassSnapshots::default());
    }

    fn end_pass(&self) {
        *self.pass.lock() = None;
    }

    fn query_managed(&self, file: &Path) -> io::Result<Vec<ProcessEntry>> {
        restart::query(file)
    }

    fn scan_handle_table(
        &self,
        target: &Path,
        owners: Option<&[u32]>,
    ) -> Result<Vec<LockRecord>, TableError> {
        let entries = self.handles()?;
        handle_table::scan_open_files(target, owners, &entries, &self.processes())
    }

    fn scan_mapped_sections(&self, target: &Path) -> Vec<LockRecord> {
        match self.handles() {
            Ok(entries) => section::scan_mapped_sections(target, &entries, &self.processes()),
            Err(e) => {
                tracing::warn!("memory-mapped scan unavailable: {}", e);
                Vec::new()
            }
        }
    }

    fn scan_working_directories(&self, target: &Path) -> Vec<LockRecord> {
        cwd::scan_working_directories(target, &self.processes())
    }

    fn command_line_suspects(&self, target: &Path) -> Vec<Suspect> {
        cwd::command_line_suspects(target, &self.processes())
    }

    fn close_handle(&self, handle: &BorrowedHandle) -> io::Result<()> {
        if process::is_critical_pid(handle.owner_pid()) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("refusing to close handles in PID {}", handle.owner_pid()),
            ));
        }
        handle::close_remote(handle.owner_pid(), handle.remote_value())
    }

    fn terminate(&self, pid: u32) -> bool {
        process::terminate(pid)
    }
}
