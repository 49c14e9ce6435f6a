//! `jfsck` — a thin CLI over [`jio::checker`] (spec §4.5, §9: the original
//! C header exposes `jfsck()`/`jfsck_cleanup()` as library calls meant to
//! be wrapped by a small standalone tool; this is that tool).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use jio::checker::{self, CheckReport};

#[derive(Parser)]
#[command(name = "jfsck", about = "Check and recover a jio-journaled data file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the journal and reapply any committed-but-unapplied records.
    Check {
        /// Path to the journaled data file.
        data_file: PathBuf,
        /// Journal directory, if not the default sibling directory.
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Remove every remaining entry in the journal directory.
    ///
    /// Only safe to run after a `check` that reports zero records left
    /// unaccounted for (spec §4.5 "intended after a successful jfsck").
    Cleanup {
        data_file: PathBuf,
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { data_file, journal } => match checker::check(&data_file, journal.as_deref()) {
            Ok(report) => {
                print_report(&report);
                ExitCode::from(0)
            }
            Err(e) => {
                eprintln!("jfsck: {e}");
                ExitCode::from(e.sentinel().unsigned_abs() as u8)
            }
        },
        Command::Cleanup { data_file, journal } => {
            match checker::cleanup(&data_file, journal.as_deref()) {
                Ok(()) => ExitCode::from(0),
                Err(e) => {
                    eprintln!("jfsck: {e}");
                    ExitCode::from(e.sentinel().unsigned_abs() as u8)
                }
            }
        }
    }
}

fn print_report(report: &CheckReport) {
    println!("total:        {}", report.total);
    println!("invalid:      {}", report.invalid);
    println!("in_progress:  {}", report.in_progress);
    println!("broken:       {}", report.broken);
    println!("corrupt:      {}", report.corrupt);
    println!("apply_error:  {}", report.apply_error);
    println!("reapplied:    {}", report.reapplied);
}
