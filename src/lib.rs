pub mod config;
pub mod cwd;
pub mod error;
pub mod handle;
pub mod handle_table;
pub mod inventory;
#[cfg(windows)]
mod ntdll;
pub mod object;
pub mod path;
pub mod platform;
pub mod privilege;
pub mod process;
pub mod restart;
pub mod safety;
pub mod section;
pub mod tree;
pub mod unlock;
pub mod winapi;

pub use config::{MoveCollision, UnlockConfig};
pub use error::{Error, Result};
pub use inventory::{HandleKind, LockHolder, LockRecord, Suspect};
pub use platform::{NativePlatform, Platform};
pub use unlock::{DeleteReport, Disposition, MoveReport, UnlockOutcome, Unlocker};
