use std::io;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use unlockr::inventory::LockInventory;
use unlockr::{config, process as procs, Disposition, Error, MoveCollision, UnlockConfig, Unlocker};

#[derive(Parser, Debug)]
#[command(name = "unlockr")]
#[command(version)]
#[command(about = "Find and break the locks that keep a file or directory from being deleted or moved")]
#[command(after_help = "EXAMPLES:\n  \
  unlockr list C:\\build\\out              Show which processes hold the path\n  \
  unlockr unlock C:\\build\\out            Close open handles on the path\n  \
  unlockr delete --kill C:\\build\\out     Unlock, terminating holders if needed, then delete\n  \
  unlockr move C:\\tmp\\log D:\\archive     Unlock and move into D:\\archive\n\n\
EXIT CODES:\n  \
  0 success, 1 failure, 2 protected path, 3 invalid path,\n  \
  4 locks could not be released, 5 delete failed after unlocking")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true,
          help = "Log progress to stderr (-vv for debug detail)")]
    verbose: u8,

    #[arg(long = "protect", value_name = "PATH", global = true,
          help = "Additional path that must never be deleted or moved")]
    protect: Vec<PathBuf>,

    #[arg(long = "protect-file", value_name = "FILE", global = true,
          help = "JSON file with an array of additional protected paths")]
    protect_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List processes holding the path
    List {
        path: PathBuf,
        #[arg(long, help = "Print machine-readable JSON")]
        json: bool,
    },
    /// Release every reference to the path
    Unlock {
        path: PathBuf,
        #[arg(short = 'k', long, help = "Terminate processes whose references cannot be closed")]
        kill: bool,
    },
    /// Unlock, then delete the path (recursively for directories)
    Delete {
        path: PathBuf,
        #[arg(short = 'k', long, help = "Terminate processes whose references cannot be closed")]
        kill: bool,
        #[arg(long = "reboot-fallback", help = "Schedule removal at next boot if deleting now fails")]
        reboot_fallback: bool,
    },
    /// Unlock, then move the path into a directory
    Move {
        path: PathBuf,
        dest: PathBuf,
        #[arg(short = 'k', long, help = "Terminate processes whose references cannot be closed")]
        kill: bool,
        #[arg(long = "on-collision", value_name = "POLICY", default_value = "fail",
              help = "When the destination exists: fail, overwrite or merge")]
        on_collision: MoveCollision,
    },
    /// Schedule the path for removal at next boot
    RebootDelete { path: PathBuf },
    /// Terminate every process with the given image name
    KillName { name: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("unlockr: {:#}", e);
            process::exit(1);
        }
    };

    match run(cli.command, Unlocker::native(config)) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("unlockr: {}", e);
            for holder in e.holders() {
                eprintln!("  {}", holder);
            }
            if let Error::DeleteFailed { errors, .. } = &e {
                for failure in errors.iter().take(5) {
                    eprintln!("  cannot remove {}", failure);
                }
                if errors.len() > 5 {
                    eprintln!("  ... and {} more errors", errors.len() - 5);
                }
            }
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_config(cli: &Cli) -> anyhow::Result<UnlockConfig> {
    let mut config = UnlockConfig::default();
    config.protected.extend(&cli.protect);

    if let Some(file) = &cli.protect_file {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read protect file '{}'", file.display()))?;
        let entries = config::parse_protect_list(&text)
            .with_context(|| format!("'{}' is not a JSON array of paths", file.display()))?;
        config.protected.extend(entries);
    }

    match &cli.command {
        Command::Delete {
            reboot_fallback, ..
        } => config.reboot_fallback = *reboot_fallback,
        Command::Move { on_collision, .. } => config.move_collision = *on_collision,
        _ => {}
    }

    Ok(config)
}

fn run(command: Command, unlocker: Unlocker) -> Result<(), Error> {
    match command {
        Command::List { path, json } => list(&unlocker, &path, json),
        Command::Unlock { path, kill } => {
            let outcome = unlocker.unlock_all(&path, kill);
            println!(
                "closed {} handle(s), terminated {} process(es)",
                outcome.unlocked_handles, outcome.killed_processes
            );
            print_notes(&outcome.errors, &outcome.advisories);
            if outcome.is_success() {
                Ok(())
            } else {
                Err(Error::LocksRemain {
                    path,
                    holders: outcome.remaining,
                })
            }
        }
        Command::Delete { path, kill, .. } => {
            let report = unlocker.delete(&path, kill)?;
            print_notes(&report.outcome.errors, &report.outcome.advisories);
            match report.disposition {
                Disposition::Deleted => println!("removed '{}'", path.display()),
                Disposition::ScheduledForReboot => {
                    println!("'{}' will be removed at next boot", path.display())
                }
            }
            Ok(())
        }
        Command::Move {
            path, dest, kill, ..
        } => {
            let report = unlocker.move_to(&path, &dest, kill)?;
            print_notes(&report.outcome.errors, &report.outcome.advisories);
            println!(
                "moved '{}' to '{}'",
                path.display(),
                report.destination.display()
            );
            Ok(())
        }
        Command::RebootDelete { path } => {
            if unlocker.schedule_delete_on_reboot(&path) {
                println!("'{}' will be removed at next boot", path.display());
                Ok(())
            } else {
                Err(Error::Io {
                    path: Some(path),
                    source: io::Error::other("could not schedule removal at next boot"),
                })
            }
        }
        Command::KillName { name } => {
            if procs::terminate_by_name(&name) {
                println!("terminated every process named '{}'", name);
                Ok(())
            } else {
                Err(Error::Io {
                    path: None,
                    source: io::Error::other(format!(
                        "no process named '{}' was terminated, or some survived",
                        name
                    )),
                })
            }
        }
    }
}

#[derive(Serialize)]
struct ListReport<'a> {
    target: String,
    strategy: &'a str,
    locks: &'a [unlockr::LockRecord],
    suspects: &'a [unlockr::Suspect],
}

fn list(unlocker: &Unlocker, path: &Path, json: bool) -> Result<(), Error> {
    let inventory: LockInventory = unlocker.inspect(path);

    if json {
        let report = ListReport {
            target: path.display().to_string(),
            strategy: inventory.strategy,
            locks: &inventory.records,
            suspects: &inventory.suspects,
        };
        let text = serde_json::to_string_pretty(&report).map_err(io::Error::from)?;
        println!("{}", text);
        return Ok(());
    }

    if inventory.records.is_empty() {
        println!("no locks on '{}'", path.display());
    }
    for record in &inventory.records {
        println!("{}", record.holder());
    }
    for suspect in &inventory.suspects {
        println!(
            "possibly related: {} (PID {}): {}",
            suspect.process_name, suspect.process_id, suspect.reason
        );
    }
    Ok(())
}

fn print_notes(errors: &[String], advisories: &[unlockr::Suspect]) {
    for error in errors {
        eprintln!("unlockr: warning: {}", error);
    }
    for suspect in advisories {
        eprintln!(
            "unlockr: note: {} (PID {}) may also use the path: {}",
            suspect.process_name, suspect.process_id, suspect.reason
        );
    }
}
