//! Permission and ownership changes applied to all three objects of a bus.
//!
//! Changes are applied to the handle file, the semaphore array and the
//! segment in that order. The first failure aborts and earlier changes stay
//! in place; running the operation again converges.

use std::{os::unix::fs as unix_fs, path::Path};

use rustix::fs::Mode;
use tracing::info;

use crate::{sem::SemaphoreSet, shm::Segment, Error, Keys, Result};

const USER: u32 = 0o700;
const GROUP: u32 = 0o070;
const OTHER: u32 = 0o007;
const READ_WRITE: u32 = 0o666;
const GROUP_OTHER_WRITE: u32 = 0o022;

/// Normalises `mode` into the bits for the IPC objects and for the file
///
/// Any bit of a class grants that class read and write access; execute has
/// no meaning for IPC objects. The file never grants write access beyond its
/// owner.
pub fn permissions(mode: u32) -> (u32, u32) {
    let ipc = [USER, GROUP, OTHER]
        .into_iter()
        .filter(|class| mode & class != 0)
        .fold(0, |acc, class| acc | class)
        & READ_WRITE;
    (ipc, ipc & !GROUP_OTHER_WRITE)
}

pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    let keys = Keys::read(path)?;
    let (ipc, file) = permissions(mode);

    rustix::fs::chmod(path, Mode::from_bits_truncate(file)).map_err(|err| Error::os("chmod", err))?;
    SemaphoreSet::open(keys.sem)?.set_mode(ipc)?;
    Segment::open(keys.shm)?.set_mode(ipc)?;

    info!(path = %path.display(), mode = format_args!("{ipc:o}"), "changed bus mode");
    Ok(())
}

pub fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let keys = Keys::read(path)?;

    unix_fs::chown(path, Some(uid), Some(gid)).map_err(|err| Error::os("chown", err))?;
    SemaphoreSet::open(keys.sem)?.set_owner(uid, gid)?;
    Segment::open(keys.shm)?.set_owner(uid, gid)?;

    info!(path = %path.display(), uid, gid, "changed bus owner");
    Ok(())
}
