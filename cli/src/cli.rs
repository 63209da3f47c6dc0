use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Broadcast messages to listening processes through a System-V IPC bus
#[derive(Debug, Clone, Parser)]
#[command(name = "bus")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a bus, printing its path if none was given
    Create {
        /// Fail if the path already exists
        #[arg(short = 'x')]
        exclusive: bool,
        /// Use the four-semaphore protocol
        #[arg(long)]
        relaxed: bool,
        path: Option<PathBuf>,
    },
    /// Remove a bus
    Remove { path: PathBuf },
    /// Run a command for every message, with the message in $msg
    Listen { path: PathBuf, command: String },
    /// Run a command for the next message, with the message in $msg
    Wait { path: PathBuf, command: String },
    /// Broadcast a message
    Broadcast {
        /// Fail instead of waiting for another writer
        #[arg(short = 'n')]
        nowait: bool,
        path: PathBuf,
        message: String,
    },
    /// Change permissions, as octal or [+-=][ugo]...
    Chmod {
        #[arg(allow_hyphen_values = true)]
        mode: String,
        path: PathBuf,
    },
    /// Change owner and optionally group, as owner[:group]
    Chown { owner: String, path: PathBuf },
    /// Change group
    Chgrp { group: String, path: PathBuf },
}
