use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::Path,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bus::{Access, Bus, Clock, CreateOptions, Deadline, SyncMode, WaitPolicy};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cli;
pub mod perm;
pub mod spawn;

use cli::{Args, Command};
use perm::UsageError;
use spawn::Spawner;

/// How often a listener looks at the exit flag while no message arrives
const TICK: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("bus: {err:#}");
            if err.is::<UsageError>() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Create {
            exclusive,
            relaxed,
            path,
        } => {
            let options = CreateOptions {
                exclusive,
                mode: if relaxed { SyncMode::Relaxed } else { SyncMode::Strict },
                ..Default::default()
            };
            let created = bus::create(path.as_deref(), &options)?;
            if path.is_none() {
                println!("{}", created.display());
            }
        }
        Command::Remove { path } => bus::unlink(&path)?,
        Command::Listen { path, command } => listen(&path, Spawner::new(command), false)?,
        Command::Wait { path, command } => listen(&path, Spawner::new(command), true)?,
        Command::Broadcast {
            nowait,
            path,
            message,
        } => {
            let session = Bus::open(&path, Access::ReadWrite)?;
            let policy = if nowait { WaitPolicy::NoWait } else { WaitPolicy::Block };
            session.write(&message, policy)?;
            session.close()?;
        }
        Command::Chmod { mode, path } => {
            let change = perm::parse_mode(&mode)?;
            let current = fs::metadata(&path)?.mode();
            bus::chmod(&path, change.apply(current))?;
        }
        Command::Chown { owner, path } => {
            let (uid, gid) = perm::parse_owner(&owner)?;
            let gid = match gid {
                Some(gid) => gid,
                None => fs::metadata(&path)?.gid(),
            };
            bus::chown(&path, uid, gid)?;
        }
        Command::Chgrp { group, path } => {
            let gid = perm::parse_gid(&group)?;
            let uid = fs::metadata(&path)?.uid();
            bus::chown(&path, uid, gid)?;
        }
    }
    Ok(())
}

/// Spawns the command for each message until interrupted, or for the first
/// one if `once` is set
fn listen(path: &Path, mut spawner: Spawner, once: bool) -> anyhow::Result<()> {
    let exit_signal = Arc::new(AtomicBool::new(false));
    let e = exit_signal.clone();
    ctrlc::set_handler(move || {
        if e.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            std::process::exit(1);
        } else {
            eprintln!("CTRL-C received, terminating (press again to kill)");
        }
    })?;

    let session = Bus::open(path, Access::ReadOnly)?;
    let mut poller = session.poll_start(WaitPolicy::Block)?;

    while !exit_signal.load(Ordering::Relaxed) {
        let deadline = Deadline::after(Clock::Monotonic, TICK);
        let message = match poller.poll_timed(&deadline) {
            Ok(message) => message,
            Err(bus::Error::TimedOut | bus::Error::Interrupted) => continue,
            Err(err) => return Err(err.into()),
        };
        spawner.spawn(message)?;
        if once {
            break;
        }
    }

    poller.stop()?;
    session.close()?;
    spawner.finish()
}
