//! Unlock orchestration: scan, release, verify, then mutate.
//!
//! ```text
//! Scanning -> Unlocking -> Verifying -> Deleting | Moving | SchedulingReboot -> Done | Failed
//! ```
//!
//! Handles are closed whenever we hold one. Processes are terminated only
//! when the caller asked for it; a working-directory binding has no handle
//! and can be broken no other way.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{MoveCollision, UnlockConfig};
use crate::error::{Error, FailedItem, Result};
use crate::inventory::{HandleKind, LockHolder, LockInventory, LockRecord, Suspect};
use crate::path;
use crate::platform::{NativePlatform, Platform};
use crate::tree;
use crate::winapi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scanning,
    Unlocking,
    Verifying,
    Deleting,
    Moving,
    SchedulingReboot,
    Done,
    Failed,
}

/// Result of one unlock attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnlockOutcome {
    pub unlocked_handles: usize,
    pub killed_processes: usize,
    pub errors: Vec<String>,
    /// Holders still present at the final verification.
    pub remaining: Vec<LockHolder>,
    /// Command-line matches; reported, never acted on.
    pub advisories: Vec<Suspect>,
}

impl UnlockOutcome {
    pub fn is_success(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    Deleted,
    ScheduledForReboot,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub outcome: UnlockOutcome,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveReport {
    pub outcome: UnlockOutcome,
    pub destination: PathBuf,
}

pub struct Unlocker<P: Platform = NativePlatform> {
    platform: P,
    config: UnlockConfig,
}

impl Unlocker<NativePlatform> {
    pub fn native(config: UnlockConfig) -> Self {
        Self::new(NativePlatform::new(), config)
    }
}

impl<P: Platform> Unlocker<P> {
    pub fn new(platform: P, config: UnlockConfig) -> Self {
        Self { platform, config }
    }

    pub fn config(&self) -> &UnlockConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn stage(&self, stage: Stage, target: &Path) {
        tracing::info!(?stage, target = %target.display(), "unlock pipeline");
    }

    /// Read-only: who holds `target` right now.
    pub fn list_locks(&self, target: &Path) -> Vec<LockRecord> {
        self.inspect(target).into_records()
    }

    /// Like [`list_locks`](Self::list_locks), keeping the advisory suspects.
    pub fn inspect(&self, target: &Path) -> LockInventory {
        let target = path::normalize(target);
        self.stage(Stage::Scanning, &target);
        LockInventory::collect(&self.platform, &target)
    }

    /// Releases every reference to `target` that can be released.
    ///
    /// Never fails; whatever could not be released is listed in
    /// [`UnlockOutcome::remaining`].
    pub fn unlock_all(&self, target: &Path, kill: bool) -> UnlockOutcome {
        let target = path::normalize(target);
        let mut outcome = UnlockOutcome::default();

        self.stage(Stage::Scanning, &target);
        let inventory = LockInventory::collect(&self.platform, &target);
        outcome.advisories = inventory.suspects.clone();
        if inventory.is_empty() {
            tracing::info!(target = %target.display(), "nothing holds target");
            return outcome;
        }

        self.stage(Stage::Unlocking, &target);
        self.release(&target, inventory, kill, &mut outcome);

        self.stage(Stage::Verifying, &target);
        self.platform.settle(self.config.settle_delay);
        let mut check = LockInventory::collect(&self.platform, &target);

        if !check.is_empty() {
            tracing::info!(
                remaining = check.records.len(),
                "references survived unlocking, retrying once"
            );
            self.stage(Stage::Unlocking, &target);
            self.release(&target, check, kill, &mut outcome);

            self.stage(Stage::Verifying, &target);
            self.platform.settle(self.config.settle_delay);
            check = LockInventory::collect(&self.platform, &target);
        }

        outcome.remaining = check.holders();
        if outcome.is_success() {
            tracing::info!(
                handles = outcome.unlocked_handles,
                killed = outcome.killed_processes,
                "target released"
            );
        } else {
            tracing::warn!(remaining = outcome.remaining.len(), "target still referenced");
        }
        outcome
    }

    /// One unlocking pass over `inventory`. Every duplicated handle in it is
    /// released when this returns.
    fn release(
        &self,
        target: &Path,
        inventory: LockInventory,
        kill: bool,
        outcome: &mut UnlockOutcome,
    ) {
        let mut needs_termination: BTreeSet<u32> = BTreeSet::new();
        let mut identity_only: BTreeSet<u32> = BTreeSet::new();

        // A shadowed record without a handle shares its pid with the record that won.
        let shadowed = inventory.shadowed.iter().filter(|r| r.is_closeable());
        for record in inventory.records.iter().chain(shadowed) {
            if record.is_closeable() {
                if !self.close_record(record, outcome) {
                    needs_termination.insert(record.process_id);
                }
            } else if record.handle_kind == HandleKind::OpenFile {
                identity_only.insert(record.process_id);
            } else {
                needs_termination.insert(record.process_id);
            }
        }

        // Restart Manager hits carry no handle; look for one in those owners only.
        if !identity_only.is_empty() {
            let owners: Vec<u32> = identity_only.iter().copied().collect();
            match self.platform.scan_handle_table(target, Some(&owners)) {
                Ok(found) => {
                    for record in found.iter().filter(|r| r.is_closeable()) {
                        if self.close_record(record, outcome) {
                            identity_only.remove(&record.process_id);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("targeted handle lookup unavailable: {}", e);
                }
            }
            needs_termination.extend(identity_only);
        }

        if needs_termination.is_empty() {
            return;
        }
        if !kill {
            tracing::info!(
                pids = ?needs_termination,
                "only termination can release these processes; not requested"
            );
            return;
        }

        let mut killed_any = false;
        for pid in needs_termination {
            let name = inventory
                .records
                .iter()
                .find(|r| r.process_id == pid)
                .map(|r| r.process_name.as_str())
                .unwrap_or("");
            if self.platform.terminate(pid) {
                outcome.killed_processes += 1;
                killed_any = true;
            } else {
                outcome
                    .errors
                    .push(format!("failed to terminate '{}' (PID {})", name, pid));
            }
        }
        if killed_any {
            self.platform.settle(self.config.kill_settle_delay);
        }
    }

    /// Closes the record's foreign handle. `false` if it has none or closing failed.
    fn close_record(&self, record: &LockRecord, outcome: &mut UnlockOutcome) -> bool {
        let Some(handle) = &record.borrowed_handle else {
            return false;
        };
        match self.platform.close_handle(handle) {
            Ok(()) => {
                tracing::debug!(
                    pid = record.process_id,
                    handle = handle.remote_value(),
                    path = %record.file_path,
                    "closed handle"
                );
                outcome.unlocked_handles += 1;
                true
            }
            Err(e) => {
                outcome.errors.push(format!(
                    "failed to close handle {:#x} in '{}' (PID {}): {}",
                    handle.remote_value(),
                    record.process_name,
                    record.process_id,
                    e
                ));
                false
            }
        }
    }

    /// Checks `target` before any mutation and returns its normalized form.
    ///
    /// The denylist is consulted before the filesystem is touched.
    pub fn validate(&self, target: &Path) -> Result<PathBuf> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: target.to_path_buf(),
            reason: reason.to_string(),
        };

        if target.to_string_lossy().trim().is_empty() {
            return Err(invalid("empty path"));
        }
        if path::has_parent_segments(target) {
            return Err(invalid("'..' segments are not allowed"));
        }

        let normalized = path::normalize(target);
        if let Some(entry) = self.config.protected.check(&normalized) {
            return Err(Error::ProtectedPath {
                path: normalized,
                entry,
            });
        }
        if !path::is_valid(&normalized) {
            return Err(invalid("not a rooted path on an existing volume"));
        }
        if !winapi::path_exists(&normalized) {
            return Err(invalid("no such file or directory"));
        }

        Ok(normalized)
    }

    /// Unlocks and deletes `target`, recursively for directories.
    pub fn delete(&self, target: &Path, kill: bool) -> Result<DeleteReport> {
        let target = self.validate(target)?;
        let mut outcome = self.unlock_all(&target, kill);

        if !outcome.is_success() {
            return self.give_up_on_delete(&target, outcome);
        }

        self.platform.settle(self.config.settle_delay);
        self.stage(Stage::Deleting, &target);
        let failures = match self.platform.remove_tree(&target) {
            Ok(()) => return Ok(self.deleted(&target, outcome)),
            Err(failures) => failures,
        };

        tracing::warn!(
            failed = failures.len(),
            "delete failed, rescanning for new holders"
        );
        self.stage(Stage::Scanning, &target);
        let inventory = LockInventory::collect(&self.platform, &target);
        if !inventory.is_empty() {
            // Holders that appeared after verification are terminated even without `kill`.
            self.stage(Stage::Unlocking, &target);
            self.release(&target, inventory, true, &mut outcome);
            self.platform.settle(self.config.settle_delay);
        }

        self.stage(Stage::Deleting, &target);
        match self.platform.remove_tree(&target) {
            Ok(()) => Ok(self.deleted(&target, outcome)),
            Err(failures) => {
                if self.config.reboot_fallback && self.schedule_delete_on_reboot(&target) {
                    self.stage(Stage::Done, &target);
                    return Ok(DeleteReport {
                        outcome,
                        disposition: Disposition::ScheduledForReboot,
                    });
                }
                self.stage(Stage::Failed, &target);
                let holders = LockInventory::collect(&self.platform, &target).holders();
                Err(Error::DeleteFailed {
                    path: target,
                    errors: failures,
                    holders,
                })
            }
        }
    }

    fn deleted(&self, target: &Path, outcome: UnlockOutcome) -> DeleteReport {
        self.stage(Stage::Done, target);
        DeleteReport {
            outcome,
            disposition: Disposition::Deleted,
        }
    }

    fn give_up_on_delete(&self, target: &Path, outcome: UnlockOutcome) -> Result<DeleteReport> {
        if self.config.reboot_fallback && self.schedule_delete_on_reboot(target) {
            self.stage(Stage::Done, target);
            return Ok(DeleteReport {
                outcome,
                disposition: Disposition::ScheduledForReboot,
            });
        }
        self.stage(Stage::Failed, target);
        Err(Error::LocksRemain {
            path: target.to_path_buf(),
            holders: outcome.remaining,
        })
    }

    /// Marks `target` (and everything under it, children first) for removal
    /// at next boot. `false` if it is protected, missing, or any entry could
    /// not be registered.
    pub fn schedule_delete_on_reboot(&self, target: &Path) -> bool {
        let target = path::normalize(target);
        if let Some(entry) = self.config.protected.check(&target) {
            tracing::warn!(
                target = %target.display(),
                entry = %entry.display(),
                "refusing to schedule protected path"
            );
            return false;
        }
        if !winapi::path_exists(&target) {
            return false;
        }

        self.stage(Stage::SchedulingReboot, &target);
        let entries: Vec<PathBuf> = if winapi::is_directory(&target) && !is_link(&target) {
            match tree::discover_tree(&target) {
                Ok(tree) => tree.removal_order().cloned().collect(),
                Err(e) => {
                    tracing::warn!("cannot list {}: {}", target.display(), e);
                    vec![target.clone()]
                }
            }
        } else {
            vec![target.clone()]
        };

        let mut all = true;
        for entry in &entries {
            if let Err(e) = self.platform.schedule_delete_on_reboot(entry) {
                tracing::warn!("cannot schedule {} for reboot: {}", entry.display(), e);
                all = false;
            }
        }
        all
    }

    /// Unlocks `target` and moves it into `destination_dir`.
    pub fn move_to(&self, target: &Path, destination_dir: &Path, kill: bool) -> Result<MoveReport> {
        let target = self.validate(target)?;
        let destination_dir = path::normalize(destination_dir);

        let move_failed = |reason: String| Error::MoveFailed {
            path: target.clone(),
            destination: destination_dir.clone(),
            reason,
        };

        if !winapi::is_directory(&destination_dir) {
            return Err(Error::InvalidPath {
                path: destination_dir.clone(),
                reason: "destination is not an existing directory".to_string(),
            });
        }
        if path::covers(
            &target.to_string_lossy(),
            &destination_dir.to_string_lossy(),
        ) {
            return Err(move_failed("destination is inside the source".to_string()));
        }
        let Some(name) = target.file_name() else {
            return Err(move_failed("source has no file name".to_string()));
        };
        let destination = destination_dir.join(name);
        if path::comparison_key(&target.to_string_lossy())
            == path::comparison_key(&destination.to_string_lossy())
        {
            return Err(move_failed("source and destination are the same".to_string()));
        }
        // A collision policy may remove whatever sits at the destination.
        if let Some(entry) = self.config.protected.check(&destination) {
            return Err(Error::ProtectedPath {
                path: destination,
                entry,
            });
        }

        let outcome = self.unlock_all(&target, kill);
        if !outcome.is_success() {
            self.stage(Stage::Failed, &target);
            return Err(Error::LocksRemain {
                path: target.clone(),
                holders: outcome.remaining,
            });
        }

        self.platform.settle(self.config.settle_delay);
        self.stage(Stage::Moving, &target);
        if let Err(reason) = place(&target, &destination, self.config.move_collision) {
            self.stage(Stage::Failed, &target);
            return Err(move_failed(reason));
        }

        self.stage(Stage::Done, &target);
        Ok(MoveReport {
            outcome,
            destination,
        })
    }
}

fn is_link(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn failed(path: &Path, error: &std::io::Error, is_dir: bool) -> FailedItem {
    FailedItem {
        path: path.to_path_buf(),
        error: error.to_string(),
        is_dir,
    }
}

fn remove_entry(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let _ = winapi::clear_attributes(path);
    let result = if is_dir {
        winapi::remove_dir(path)
    } else {
        winapi::delete_file(path)
    };
    match result {
        Err(e) if winapi::is_not_found_error(&e) => Ok(()),
        other => other,
    }
}

/// Deletes `target`. Directories are emptied file by file, then removed
/// deepest first; a directory above a failed entry is not attempted.
pub fn remove_tree(target: &Path) -> std::result::Result<(), Vec<FailedItem>> {
    let link = is_link(target);
    if link || !winapi::is_directory(target) {
        // A directory symlink is removed as a directory only on Windows.
        let is_dir = winapi::is_directory(target) && (!link || cfg!(windows));
        return remove_entry(target, is_dir).map_err(|e| vec![failed(target, &e, is_dir)]);
    }

    let tree = tree::discover_tree(target).map_err(|e| vec![failed(target, &e, true)])?;

    let mut failures: Vec<FailedItem> = tree
        .unreadable
        .iter()
        .map(|(dir, e)| failed(dir, e, true))
        .collect();

    for file in &tree.files {
        if let Err(e) = remove_entry(file, false) {
            failures.push(failed(file, &e, false));
        }
    }

    for dir in &tree.dirs {
        let dir_str = dir.to_string_lossy();
        let blocked = failures
            .iter()
            .any(|f| path::is_within(&f.path.to_string_lossy(), &dir_str));
        if blocked {
            continue;
        }
        if let Err(e) = remove_entry(dir, true) {
            failures.push(failed(dir, &e, true));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

/// Puts `from` at `to`, resolving an existing `to` per `policy`.
fn place(from: &Path, to: &Path, policy: MoveCollision) -> std::result::Result<(), String> {
    if winapi::path_exists(to) || is_link(to) {
        match policy {
            MoveCollision::Fail => {
                return Err(format!("'{}' already exists", to.display()));
            }
            MoveCollision::Merge
                if winapi::is_directory(from)
                    && !is_link(from)
                    && winapi::is_directory(to)
                    && !is_link(to) =>
            {
                return merge_dirs(from, to);
            }
            MoveCollision::Overwrite | MoveCollision::Merge => {
                remove_tree(to).map_err(describe_failures)?;
            }
        }
    }
    rename(from, to)
}

fn merge_dirs(from: &Path, to: &Path) -> std::result::Result<(), String> {
    let mut children = Vec::new();
    winapi::enumerate_files(from, |entry| {
        children.push(entry.path);
        Ok(())
    })
    .map_err(|e| format!("cannot list '{}': {}", from.display(), e))?;

    for child in children {
        let Some(name) = child.file_name() else {
            continue;
        };
        place(&child, &to.join(name), MoveCollision::Merge)?;
    }

    remove_entry(from, true).map_err(|e| format!("cannot remove '{}': {}", from.display(), e))
}

/// Same-volume rename, or copy then delete across volumes.
fn rename(from: &Path, to: &Path) -> std::result::Result<(), String> {
    match winapi::move_path(from, to) {
        Ok(()) => Ok(()),
        Err(e) if winapi::is_cross_device_error(&e) => {
            tracing::info!(
                from = %from.display(),
                to = %to.display(),
                "different volume, copying"
            );
            copy_tree(from, to).map_err(|e| format!("copy to '{}' failed: {}", to.display(), e))?;
            remove_tree(from).map_err(describe_failures)
        }
        Err(e) => Err(format!("rename to '{}' failed: {}", to.display(), e)),
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    if !winapi::is_directory(from) {
        fs::copy(from, to)?;
        return Ok(());
    }

    fs::create_dir(to)?;
    let mut children = Vec::new();
    winapi::enumerate_files(from, |entry| {
        children.push(entry.path);
        Ok(())
    })?;
    for child in children {
        if let Some(name) = child.file_name() {
            copy_tree(&child, &to.join(name))?;
        }
    }
    Ok(())
}

fn describe_failures(failures: Vec<FailedItem>) -> String {
    failures
        .iter()
        .map(FailedItem::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_tree_deletes_nested_readonly_entries() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("victim");
        fs::create_dir_all(root.join("a/b")).unwrap();
        let locked = root.join("a/b/ro.txt");
        fs::write(&locked, "x").unwrap();
        fs::write(root.join("top.txt"), "y").unwrap();
        let mut perms = fs::metadata(&locked).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&locked, perms).unwrap();

        remove_tree(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn remove_tree_of_missing_path_succeeds() {
        let temp = tempfile::tempdir().unwrap();
        assert!(remove_tree(&temp.path().join("gone.txt")).is_ok());
    }

    #[test]
    fn place_honours_collision_policy() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();

        assert!(place(&src, &dst, MoveCollision::Fail).is_err());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");

        place(&src, &dst, MoveCollision::Overwrite).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }

    #[test]
    fn merge_combines_directories() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::create_dir_all(dst.join("sub")).unwrap();
        fs::write(src.join("sub/new.txt"), "n").unwrap();
        fs::write(src.join("both.txt"), "from src").unwrap();
        fs::write(dst.join("both.txt"), "from dst").unwrap();
        fs::write(dst.join("sub/kept.txt"), "k").unwrap();

        place(&src, &dst, MoveCollision::Merge).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("both.txt")).unwrap(), "from src");
        assert!(dst.join("sub/new.txt").exists());
        assert!(dst.join("sub/kept.txt").exists());
    }

    #[test]
    fn copy_tree_duplicates_structure() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a")).unwrap();
        fs::write(src.join("a/f.txt"), "f").unwrap();

        let dst = temp.path().join("copy");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a/f.txt")).unwrap(), "f");
        assert!(src.join("a/f.txt").exists());
    }
}
