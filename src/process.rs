//! Process naming and termination.

use std::collections::BTreeMap;
use std::path::PathBuf;

#[cfg(not(windows))]
use sysinfo::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[cfg(windows)]
use windows::Win32::System::Threading::{TerminateProcess, PROCESS_TERMINATE};

#[cfg(windows)]
use crate::handle;

pub const TERMINATE_EXIT_CODE: u32 = 1;

/// The idle process, the kernel's System process, and ourselves.
pub fn is_critical_pid(pid: u32) -> bool {
    pid == 0 || pid == 4 || pid == std::process::id()
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
    pub exe: Option<PathBuf>,
}

/// Point-in-time list of running processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    processes: BTreeMap<u32, ProcessSummary>,
}

impl ProcessTable {
    pub fn snapshot() -> Self {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_exe(UpdateKind::OnlyIfNotSet),
        );

        let processes = sys
            .processes()
            .iter()
            .map(|(pid, proc_info)| {
                let command_line = proc_info
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let summary = ProcessSummary {
                    pid: pid.as_u32(),
                    name: proc_info.name().to_string_lossy().to_string(),
                    command_line,
                    exe: proc_info.exe().map(|p| p.to_path_buf()),
                };
                (summary.pid, summary)
            })
            .collect();

        Self { processes }
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ProcessSummary>,
    {
        Self {
            processes: entries.into_iter().map(|p| (p.pid, p)).collect(),
        }
    }

    /// Display name, or empty if the process has gone.
    pub fn name_of(&self, pid: u32) -> String {
        self.processes
            .get(&pid)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessSummary> {
        self.processes.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessSummary> {
        self.processes.values()
    }

    /// Pids whose image name is `name`, compared case-insensitively and with
    /// or without an `.exe` suffix.
    pub fn pids_named(&self, name: &str) -> Vec<u32> {
        let wanted = strip_exe(name);
        self.processes
            .values()
            .filter(|p| strip_exe(&p.name) == wanted)
            .map(|p| p.pid)
            .collect()
    }
}

fn strip_exe(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Terminates `pid`. Any failure, including a refused critical pid, is `false`.
pub fn terminate(pid: u32) -> bool {
    if is_critical_pid(pid) {
        tracing::warn!(pid, "refusing to terminate system or own process");
        return false;
    }

    let killed = terminate_native(pid);
    if killed {
        tracing::info!(pid, "terminated process");
    } else {
        tracing::warn!(pid, "could not terminate process");
    }
    killed
}

#[cfg(windows)]
fn terminate_native(pid: u32) -> bool {
    let Some(process) = handle::open_process(pid, PROCESS_TERMINATE) else {
        return false;
    };
    unsafe { TerminateProcess(process.raw(), TERMINATE_EXIT_CODE) }.is_ok()
}

#[cfg(not(windows))]
fn terminate_native(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.kill()).unwrap_or(false)
}

/// Terminates every process named `name`. True only if at least one matched
/// and every match was terminated.
pub fn terminate_by_name(name: &str) -> bool {
    terminate_matching(&ProcessTable::snapshot(), name, terminate)
}

pub(crate) fn terminate_matching<F>(table: &ProcessTable, name: &str, mut kill: F) -> bool
where
    F: FnMut(u32) -> bool,
{
    let pids: Vec<u32> = table
        .pids_named(name)
        .into_iter()
        .filter(|pid| !is_critical_pid(*pid))
        .collect();
    if pids.is_empty() {
        tracing::info!(name, "no process to terminate");
        return false;
    }

    let mut all = true;
    for pid in pids {
        all &= kill(pid);
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(pid: u32, name: &str) -> ProcessSummary {
        ProcessSummary {
            pid,
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn critical_pids_are_never_terminated() {
        assert!(is_critical_pid(0));
        assert!(is_critical_pid(4));
        assert!(is_critical_pid(std::process::id()));
        assert!(!terminate(0));
        assert!(!terminate(std::process::id()));
    }

    #[test]
    fn names_match_without_case_or_exe_suffix() {
        let table = ProcessTable::from_entries(vec![
            summary(10, "Notepad.exe"),
            summary(11, "notepad"),
            summary(12, "explorer.exe"),
        ]);
        assert_eq!(table.pids_named("NOTEPAD.EXE"), vec![10, 11]);
        assert_eq!(table.pids_named("explorer"), vec![12]);
        assert_eq!(table.name_of(12), "explorer.exe");
        assert_eq!(table.name_of(99), "");
    }

    #[test]
    fn batch_kill_requires_every_match_to_die() {
        let table = ProcessTable::from_entries(vec![
            summary(10, "worker.exe"),
            summary(11, "worker.exe"),
        ]);

        let mut seen = Vec::new();
        assert!(terminate_matching(&table, "worker", |pid| {
            seen.push(pid);
            true
        }));
        assert_eq!(seen, vec![10, 11]);

        assert!(!terminate_matching(&table, "worker", |pid| pid == 10));
    }

    #[test]
    fn batch_kill_with_no_match_fails() {
        let table = ProcessTable::from_entries(vec![summary(10, "worker.exe")]);
        assert!(!terminate_matching(&table, "ghost", |_| true));
    }

    #[test]
    fn snapshot_contains_this_process() {
        let table = ProcessTable::snapshot();
        assert!(table.get(std::process::id()).is_some());
    }
}
