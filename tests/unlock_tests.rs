use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use unlockr::error::FailedItem;
use unlockr::handle::BorrowedHandle;
use unlockr::handle_table::TableError;
use unlockr::inventory::ProcessEntry;
use unlockr::safety::ProtectedPaths;
use unlockr::{
    path, Disposition, Error, HandleKind, LockRecord, MoveCollision, Platform, Suspect,
    UnlockConfig, Unlocker,
};

#[derive(Clone)]
struct Hold {
    pid: u32,
    name: &'static str,
    path: PathBuf,
    handle: usize,
}

#[derive(Default)]
struct World {
    open: Vec<Hold>,
    mapped: Vec<Hold>,
    cwd: Vec<Hold>,
    suspects: Vec<Suspect>,
    managed_fails: bool,
    legacy_fails: bool,
    stubborn_handles: HashSet<usize>,
    unkillable: HashSet<u32>,
    closed: Vec<(u32, usize)>,
    killed: Vec<u32>,
    scheduled: Vec<PathBuf>,
    /// Deletes that fail before touching the disk.
    failing_deletes: usize,
    /// Working-directory holders that move in when a delete fails.
    late_arrivals: Vec<Hold>,
    deletes: usize,
    queries: usize,
    passes: (usize, usize),
    settles: Vec<Duration>,
}

/// Scripted stand-in for the OS: holders are declared up front and vanish
/// when their handle is closed or their process is terminated.
#[derive(Default)]
struct FakePlatform {
    world: RefCell<World>,
}

impl FakePlatform {
    fn open(self, pid: u32, name: &'static str, path: &Path, handle: usize) -> Self {
        self.world.borrow_mut().open.push(Hold {
            pid,
            name,
            path: path.to_path_buf(),
            handle,
        });
        self
    }

    fn map(self, pid: u32, name: &'static str, path: &Path, handle: usize) -> Self {
        self.world.borrow_mut().mapped.push(Hold {
            pid,
            name,
            path: path.to_path_buf(),
            handle,
        });
        self
    }

    fn cwd(self, pid: u32, name: &'static str, path: &Path) -> Self {
        self.world.borrow_mut().cwd.push(Hold {
            pid,
            name,
            path: path.to_path_buf(),
            handle: 0,
        });
        self
    }

    fn with(self, f: impl FnOnce(&mut World)) -> Self {
        f(&mut self.world.borrow_mut());
        self
    }
}

fn covered(target: &Path, hold: &Hold) -> bool {
    path::covers(&target.to_string_lossy(), &hold.path.to_string_lossy())
}

fn record(hold: &Hold, kind: HandleKind, with_handle: bool) -> LockRecord {
    LockRecord {
        process_id: hold.pid,
        process_name: hold.name.to_string(),
        borrowed_handle: with_handle.then(|| BorrowedHandle::detached(hold.pid, hold.handle)),
        file_path: hold.path.to_string_lossy().into_owned(),
        handle_kind: kind,
    }
}

impl Platform for FakePlatform {
    fn begin_pass(&self) {
        self.world.borrow_mut().passes.0 += 1;
    }

    fn end_pass(&self) {
        self.world.borrow_mut().passes.1 += 1;
    }

    fn query_managed(&self, file: &Path) -> io::Result<Vec<ProcessEntry>> {
        let mut world = self.world.borrow_mut();
        world.queries += 1;
        if world.managed_fails {
            return Err(io::Error::other("restart manager unavailable"));
        }
        let key = path::comparison_key(&file.to_string_lossy());
        let mut entries: Vec<ProcessEntry> = Vec::new();
        for hold in world.open.iter().chain(world.mapped.iter()) {
            if path::comparison_key(&hold.path.to_string_lossy()) == key
                && !entries.iter().any(|e| e.pid == hold.pid)
            {
                entries.push(ProcessEntry {
                    pid: hold.pid,
                    name: hold.name.to_string(),
                });
            }
        }
        Ok(entries)
    }

    fn scan_handle_table(
        &self,
        target: &Path,
        owners: Option<&[u32]>,
    ) -> Result<Vec<LockRecord>, TableError> {
        let mut world = self.world.borrow_mut();
        world.queries += 1;
        if world.legacy_fails {
            return Err(TableError::RetriesExhausted { attempts: 5 });
        }
        Ok(world
            .open
            .iter()
            .filter(|h| covered(target, h))
            .filter(|h| owners.map_or(true, |o| o.contains(&h.pid)))
            .map(|h| record(h, HandleKind::OpenFile, true))
            .collect())
    }

    fn scan_mapped_sections(&self, target: &Path) -> Vec<LockRecord> {
        let mut world = self.world.borrow_mut();
        world.queries += 1;
        world
            .mapped
            .iter()
            .filter(|h| covered(target, h))
            .map(|h| record(h, HandleKind::MemoryMapped, true))
            .collect()
    }

    fn scan_working_directories(&self, target: &Path) -> Vec<LockRecord> {
        let mut world = self.world.borrow_mut();
        world.queries += 1;
        world
            .cwd
            .iter()
            .filter(|h| covered(target, h))
            .map(|h| record(h, HandleKind::WorkingDirectory, false))
            .collect()
    }

    fn command_line_suspects(&self, _target: &Path) -> Vec<Suspect> {
        self.world.borrow().suspects.clone()
    }

    fn close_handle(&self, handle: &BorrowedHandle) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        let (pid, value) = (handle.owner_pid(), handle.remote_value());
        if world.stubborn_handles.contains(&value) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let before = world.open.len() + world.mapped.len();
        world.open.retain(|h| !(h.pid == pid && h.handle == value));
        world.mapped.retain(|h| !(h.pid == pid && h.handle == value));
        if world.open.len() + world.mapped.len() == before {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        world.closed.push((pid, value));
        Ok(())
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut world = self.world.borrow_mut();
        world.killed.push(pid);
        if world.unkillable.contains(&pid) {
            return false;
        }
        world.open.retain(|h| h.pid != pid);
        world.mapped.retain(|h| h.pid != pid);
        world.cwd.retain(|h| h.pid != pid);
        true
    }

    fn remove_tree(&self, target: &Path) -> Result<(), Vec<FailedItem>> {
        let mut world = self.world.borrow_mut();
        world.deletes += 1;
        if world.failing_deletes > 0 {
            world.failing_deletes -= 1;
            let arrivals = std::mem::take(&mut world.late_arrivals);
            world.cwd.extend(arrivals);
            return Err(vec![FailedItem {
                path: target.to_path_buf(),
                error: "The process cannot access the file".to_string(),
                is_dir: target.is_dir(),
            }]);
        }
        drop(world);
        unlockr::unlock::remove_tree(target)
    }

    fn schedule_delete_on_reboot(&self, path: &Path) -> io::Result<()> {
        self.world.borrow_mut().scheduled.push(path.to_path_buf());
        Ok(())
    }

    fn settle(&self, delay: Duration) {
        self.world.borrow_mut().settles.push(delay);
    }
}

fn config() -> UnlockConfig {
    UnlockConfig {
        protected: ProtectedPaths::empty(),
        ..UnlockConfig::default()
    }
}

fn unlocker(platform: FakePlatform) -> Unlocker<FakePlatform> {
    Unlocker::new(platform, config())
}

/// A directory with `a.txt`, `b.txt` and `c.txt`.
fn three_files() -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("project");
    fs::create_dir(&dir).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(dir.join(name), name).unwrap();
    }
    (temp, dir)
}

#[test]
fn unreferenced_path_unlocks_trivially() {
    let (_temp, dir) = three_files();
    let unlocker = unlocker(FakePlatform::default());

    let outcome = unlocker.unlock_all(&dir, false);

    assert!(outcome.is_success());
    assert_eq!(outcome.unlocked_handles, 0);
    assert_eq!(outcome.killed_processes, 0);
    assert!(outcome.errors.is_empty());
}

#[test]
fn synthetic_holder_is_listed_once_and_released() {
    let (_temp, dir) = three_files();
    let file = dir.join("a.txt");
    let unlocker = unlocker(FakePlatform::default().open(4242, "holder.exe", &file, 0x1a8));

    let locks = unlocker.list_locks(&file);
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].process_id, 4242);
    assert_eq!(locks[0].handle_kind, HandleKind::OpenFile);

    let outcome = unlocker.unlock_all(&file, true);
    assert!(outcome.is_success());
    assert!(unlocker.list_locks(&file).is_empty());
}

#[test]
fn read_handle_in_directory_is_closed_without_killing() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().open(77, "viewer.exe", &dir.join("b.txt"), 0x2c);
    let unlocker = unlocker(platform);

    let outcome = unlocker.unlock_all(&dir, false);
    assert_eq!(outcome.unlocked_handles, 1);
    assert_eq!(outcome.killed_processes, 0);
    assert!(outcome.is_success());

    let report = unlocker.delete(&dir, false).unwrap();
    assert_eq!(report.disposition, Disposition::Deleted);
    assert!(!dir.exists());

    let world = unlocker.platform().world.borrow();
    assert_eq!(world.closed, vec![(77, 0x2c)]);
    assert!(world.killed.is_empty());
}

#[test]
fn mapped_file_is_reported_as_memory_mapped() {
    let (_temp, dir) = three_files();
    let file = dir.join("c.txt");
    let unlocker = unlocker(FakePlatform::default().map(55, "loader.exe", &file, 0x90));

    let locks = unlocker.list_locks(&file);
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].process_id, 55);
    assert_eq!(locks[0].handle_kind, HandleKind::MemoryMapped);
    assert!(locks[0].is_closeable());

    let outcome = unlocker.unlock_all(&file, true);
    assert!(outcome.is_success());
    assert_eq!(outcome.unlocked_handles, 1);
    assert_eq!(outcome.killed_processes, 0);
}

#[test]
fn working_directory_needs_termination() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().cwd(300, "shell.exe", &dir);
    let unlocker = unlocker(platform);

    let locks = unlocker.list_locks(&dir);
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].handle_kind, HandleKind::WorkingDirectory);

    let err = unlocker.delete(&dir, false).unwrap_err();
    assert!(matches!(err, Error::LocksRemain { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(err.holders()[0].process_id, 300);
    assert!(dir.exists());
    assert!(unlocker.platform().world.borrow().killed.is_empty());

    let report = unlocker.delete(&dir, true).unwrap();
    assert_eq!(report.outcome.killed_processes, 1);
    assert_eq!(report.disposition, Disposition::Deleted);
    assert!(!dir.exists());
}

#[test]
fn protected_path_is_rejected_before_any_scan() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().open(9, "locker.exe", &dir.join("a.txt"), 0x10);
    let config = UnlockConfig {
        protected: ProtectedPaths::empty().with(&dir),
        ..UnlockConfig::default()
    };
    let unlocker = Unlocker::new(platform, config);

    let err = unlocker.delete(&dir, true).unwrap_err();
    assert!(matches!(err, Error::ProtectedPath { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(dir.join("a.txt").exists());

    let world = unlocker.platform().world.borrow();
    assert_eq!(world.queries, 0);
    assert!(world.closed.is_empty() && world.killed.is_empty());
}

#[test]
fn parent_of_protected_entry_is_protected() {
    let (temp, dir) = three_files();
    let config = UnlockConfig {
        protected: ProtectedPaths::empty().with(dir.join("a.txt")),
        ..UnlockConfig::default()
    };
    let unlocker = Unlocker::new(FakePlatform::default(), config);

    assert!(matches!(
        unlocker.delete(&dir, false),
        Err(Error::ProtectedPath { .. })
    ));
    assert!(matches!(
        unlocker.delete(temp.path(), false),
        Err(Error::ProtectedPath { .. })
    ));
    assert!(dir.exists());
}

#[test]
fn invalid_paths_are_rejected() {
    let (temp, dir) = three_files();
    let unlocker = unlocker(FakePlatform::default());

    for bad in [
        PathBuf::from(""),
        PathBuf::from("   "),
        dir.join("..").join("project"),
        temp.path().join("missing"),
    ] {
        let err = unlocker.delete(&bad, false).unwrap_err();
        assert!(
            matches!(err, Error::InvalidPath { .. }),
            "{:?} gave {:?}",
            bad,
            err
        );
        assert_eq!(err.exit_code(), 3);
    }
    assert!(dir.exists());
}

#[test]
fn handle_table_is_used_only_when_restart_manager_fails() {
    let (_temp, dir) = three_files();
    let file = dir.join("a.txt");
    let platform = FakePlatform::default()
        .open(12, "editor.exe", &file, 0x44)
        .with(|w| w.managed_fails = true);
    let unlocker = unlocker(platform);

    let inventory = unlocker.inspect(&dir);
    assert_eq!(inventory.strategy, "handle-table");
    assert_eq!(inventory.records.len(), 1);
    assert!(inventory.records[0].is_closeable());

    let outcome = unlocker.unlock_all(&dir, false);
    assert_eq!(outcome.unlocked_handles, 1);
    assert!(outcome.is_success());
}

#[test]
fn failed_discovery_still_reports_mappings() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default()
        .open(12, "editor.exe", &dir.join("a.txt"), 0x44)
        .map(13, "indexer.exe", &dir.join("b.txt"), 0x48)
        .with(|w| {
            w.managed_fails = true;
            w.legacy_fails = true;
        });
    let unlocker = unlocker(platform);

    let inventory = unlocker.inspect(&dir);
    assert_eq!(inventory.strategy, "none");
    assert_eq!(inventory.records.len(), 1);
    assert_eq!(inventory.records[0].handle_kind, HandleKind::MemoryMapped);
}

#[test]
fn stubborn_handle_escalates_only_with_kill() {
    let (_temp, dir) = three_files();
    let file = dir.join("a.txt");
    let build = || {
        FakePlatform::default()
            .open(21, "sync.exe", &file, 0x60)
            .with(|w| {
                w.managed_fails = true;
                w.stubborn_handles.insert(0x60);
            })
    };

    let gentle = unlocker(build());
    let outcome = gentle.unlock_all(&file, false);
    assert!(!outcome.is_success());
    assert_eq!(outcome.remaining[0].process_id, 21);
    assert!(outcome.errors.iter().any(|e| e.contains("PID 21")));

    let forceful = unlocker(build());
    let outcome = forceful.unlock_all(&file, true);
    assert!(outcome.is_success());
    assert_eq!(outcome.killed_processes, 1);
    assert_eq!(forceful.platform().world.borrow().killed, vec![21]);
}

#[test]
fn unkillable_holder_falls_back_to_reboot_when_allowed() {
    let (_temp, dir) = three_files();
    fs::create_dir(dir.join("sub")).unwrap();
    fs::write(dir.join("sub/deep.txt"), "d").unwrap();

    let build = || {
        FakePlatform::default()
            .cwd(400, "service.exe", &dir)
            .with(|w| {
                w.unkillable.insert(400);
            })
    };

    let strict = unlocker(build());
    let err = strict.delete(&dir, true).unwrap_err();
    assert!(matches!(err, Error::LocksRemain { .. }));
    assert!(strict.platform().world.borrow().scheduled.is_empty());

    let config = UnlockConfig {
        reboot_fallback: true,
        ..config()
    };
    let lenient = Unlocker::new(build(), config);
    let report = lenient.delete(&dir, true).unwrap();
    assert_eq!(report.disposition, Disposition::ScheduledForReboot);
    assert!(dir.exists());

    let world = lenient.platform().world.borrow();
    let scheduled = &world.scheduled;
    assert_eq!(scheduled.len(), 6);
    assert_eq!(scheduled.last(), Some(&dir));
    let pos = |p: &Path| scheduled.iter().position(|s| s == p).unwrap();
    assert!(pos(dir.join("sub/deep.txt").as_path()) < pos(dir.join("sub").as_path()));
    assert!(pos(dir.join("a.txt").as_path()) < pos(dir.as_path()));
}

#[test]
fn suspects_are_advisory_only() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().with(|w| {
        w.suspects.push(Suspect {
            process_id: 600,
            process_name: "build.exe".into(),
            reason: "command line mentions target".into(),
        })
    });
    let unlocker = unlocker(platform);

    let outcome = unlocker.unlock_all(&dir, true);
    assert!(outcome.is_success());
    assert_eq!(outcome.advisories.len(), 1);
    assert_eq!(outcome.advisories[0].process_id, 600);
    assert!(unlocker.platform().world.borrow().killed.is_empty());
}

#[test]
fn system_processes_are_ignored() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default()
        .open(4, "System", &dir.join("a.txt"), 0x4)
        .open(std::process::id(), "self", &dir.join("b.txt"), 0x8);
    let unlocker = unlocker(platform);

    assert!(unlocker.list_locks(&dir).is_empty());
    let outcome = unlocker.unlock_all(&dir, true);
    assert_eq!(outcome.killed_processes, 0);
    assert!(unlocker.platform().world.borrow().closed.is_empty());
}

#[test]
fn settle_delays_follow_config() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().cwd(300, "shell.exe", &dir);
    let unlocker = unlocker(platform);

    unlocker.unlock_all(&dir, true);
    let world = unlocker.platform().world.borrow();
    assert!(world.settles.contains(&Duration::from_millis(200)));
    assert!(world.settles.contains(&Duration::from_millis(150)));
}

#[test]
fn move_unlocks_then_moves() {
    let (temp, dir) = three_files();
    let dest = temp.path().join("archive");
    fs::create_dir(&dest).unwrap();
    let platform = FakePlatform::default().open(31, "viewer.exe", &dir.join("a.txt"), 0x70);
    let unlocker = unlocker(platform);

    let report = unlocker.move_to(&dir, &dest, false).unwrap();
    assert_eq!(report.destination, dest.join("project"));
    assert_eq!(report.outcome.unlocked_handles, 1);
    assert!(!dir.exists());
    assert!(dest.join("project/a.txt").exists());
}

#[test]
fn move_collision_fails_by_default() {
    let (temp, dir) = three_files();
    let dest = temp.path().join("archive");
    fs::create_dir_all(dest.join("project")).unwrap();
    let unlocker = unlocker(FakePlatform::default());

    let err = unlocker.move_to(&dir, &dest, false).unwrap_err();
    assert!(matches!(err, Error::MoveFailed { .. }));
    assert!(dir.exists());
}

#[test]
fn move_collision_merge_combines() {
    let (temp, dir) = three_files();
    let dest = temp.path().join("archive");
    fs::create_dir_all(dest.join("project")).unwrap();
    fs::write(dest.join("project/old.txt"), "old").unwrap();
    let config = UnlockConfig {
        move_collision: MoveCollision::Merge,
        ..config()
    };
    let unlocker = Unlocker::new(FakePlatform::default(), config);

    unlocker.move_to(&dir, &dest, false).unwrap();
    assert!(!dir.exists());
    assert!(dest.join("project/old.txt").exists());
    assert!(dest.join("project/c.txt").exists());
}

#[test]
fn move_into_itself_is_refused() {
    let (_temp, dir) = three_files();
    let inner = dir.join("inner");
    fs::create_dir(&inner).unwrap();
    let unlocker = unlocker(FakePlatform::default());

    let err = unlocker.move_to(&dir, &inner, false).unwrap_err();
    assert!(matches!(err, Error::MoveFailed { .. }));
    assert!(dir.exists());
}

#[test]
fn schedule_refuses_protected_and_missing() {
    let (temp, dir) = three_files();
    let config = UnlockConfig {
        protected: ProtectedPaths::empty().with(&dir),
        ..UnlockConfig::default()
    };
    let unlocker = Unlocker::new(FakePlatform::default(), config);

    assert!(!unlocker.schedule_delete_on_reboot(&dir));
    assert!(!unlocker.schedule_delete_on_reboot(&temp.path().join("missing")));
    assert!(unlocker.platform().world.borrow().scheduled.is_empty());
}

#[test]
fn every_scan_runs_inside_one_pass() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().open(12, "editor.exe", &dir.join("a.txt"), 0x44);
    let unlocker = unlocker(platform);

    unlocker.delete(&dir, false).unwrap();

    let world = unlocker.platform().world.borrow();
    assert_eq!(world.passes.0, world.passes.1);
    assert_eq!(world.passes.0, 2);
}

#[test]
fn failed_delete_terminates_holders_that_arrived_late() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().with(|w| {
        w.failing_deletes = 1;
        w.late_arrivals.push(Hold {
            pid: 600,
            name: "shell.exe",
            path: dir.clone(),
            handle: 0,
        });
    });
    let unlocker = unlocker(platform);

    let report = unlocker.delete(&dir, false).unwrap();

    assert_eq!(report.disposition, Disposition::Deleted);
    assert_eq!(report.outcome.killed_processes, 1);
    assert!(!dir.exists());
    let world = unlocker.platform().world.borrow();
    assert_eq!(world.killed, vec![600]);
    assert_eq!(world.deletes, 2);
}

#[test]
fn delete_that_keeps_failing_reports_holders() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().with(|w| {
        w.failing_deletes = 2;
        w.unkillable.insert(601);
        w.late_arrivals.push(Hold {
            pid: 601,
            name: "service.exe",
            path: dir.clone(),
            handle: 0,
        });
    });
    let unlocker = unlocker(platform);

    let err = unlocker.delete(&dir, false).unwrap_err();

    assert_eq!(err.exit_code(), 5);
    let Error::DeleteFailed { errors, holders, .. } = &err else {
        panic!("expected DeleteFailed, got {:?}", err);
    };
    assert_eq!(errors.len(), 1);
    assert!(holders.iter().any(|h| h.process_id == 601));
    assert!(dir.join("a.txt").exists());
    let world = unlocker.platform().world.borrow();
    assert_eq!(world.killed, vec![601]);
    assert_eq!(world.deletes, 2);
    assert!(world.scheduled.is_empty());
}

#[test]
fn delete_that_keeps_failing_falls_back_to_reboot() {
    let (_temp, dir) = three_files();
    let platform = FakePlatform::default().with(|w| w.failing_deletes = 2);
    let config = UnlockConfig {
        reboot_fallback: true,
        ..config()
    };
    let unlocker = Unlocker::new(platform, config);

    let report = unlocker.delete(&dir, false).unwrap();

    assert_eq!(report.disposition, Disposition::ScheduledForReboot);
    let world = unlocker.platform().world.borrow();
    assert_eq!(world.deletes, 2);
    assert_eq!(world.scheduled.last(), Some(&dir));
}

#[test]
fn move_into_own_parent_is_refused_under_every_policy() {
    for policy in [MoveCollision::Fail, MoveCollision::Overwrite, MoveCollision::Merge] {
        let (temp, dir) = three_files();
        let config = UnlockConfig {
            move_collision: policy,
            ..config()
        };
        let unlocker = Unlocker::new(FakePlatform::default(), config);

        let file = dir.join("a.txt");
        let err = unlocker.move_to(&file, &dir, false).unwrap_err();
        assert!(matches!(err, Error::MoveFailed { .. }), "{}: {:?}", policy, err);
        assert_eq!(fs::read_to_string(&file).unwrap(), "a.txt");

        let err = unlocker.move_to(&dir, temp.path(), false).unwrap_err();
        assert!(matches!(err, Error::MoveFailed { .. }), "{}: {:?}", policy, err);
        for name in ["a.txt", "b.txt", "c.txt"] {
            assert!(dir.join(name).exists(), "{}: lost {}", policy, name);
        }
    }
}

#[test]
fn move_onto_protected_entry_is_refused() {
    let (temp, dir) = three_files();
    let system = temp.path().join("system");
    let vital = system.join("project");
    fs::create_dir_all(&vital).unwrap();
    fs::write(vital.join("vital.txt"), "keep").unwrap();
    let config = UnlockConfig {
        move_collision: MoveCollision::Overwrite,
        protected: ProtectedPaths::empty().with(&vital),
        ..config()
    };
    let unlocker = Unlocker::new(FakePlatform::default(), config);

    let err = unlocker.move_to(&dir, &system, false).unwrap_err();

    assert!(matches!(err, Error::ProtectedPath { .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(fs::read_to_string(vital.join("vital.txt")).unwrap(), "keep");
    assert!(dir.join("a.txt").exists());
    assert_eq!(unlocker.platform().world.borrow().queries, 0);
}
