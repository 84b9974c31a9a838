use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "causer-history")]
#[command(about = "Inspect persisted causer call-site history files")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every call site recorded in a history file
    Show {
        /// History file (defaults to `<binary>_callstack.info` in the
        /// current directory's sibling of the named binary)
        file: PathBuf,

        /// Sort by watched ratio descending (the sites most likely to get
        /// a watchpoint next run) instead of file order
        #[arg(long)]
        by_ratio: bool,

        /// Only show the top N call sites
        #[arg(long, short = 'n')]
        top: Option<usize>,

        /// Resolve frames to file:line using DWARF info, when the backing
        /// binaries are still present at their recorded paths
        #[arg(long)]
        symbolicate: bool,
    },

    /// List `*_callstack.info` files in a directory
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}
