//! System-V semaphore array backing a bus.
//!
//! Every participant works on the same array, so each semaphore has a fixed
//! role in the broadcast protocol:
//!
//! * [`S`] counts readers that are registered for the next message
//! * [`W`] counts readers that are re-registering after a message
//! * [`X`] is the writer lock, `1` while no writer is broadcasting
//! * [`Q`] is reset to `0` by the writer once the segment holds a message
//! * [`N`] is `1` while a writer waits for its readers (strict mode only)

use std::{io, time::Duration};

use libc::{c_int, c_short, key_t, sembuf, semid_ds};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::{handle, CheckOk, Deadline, Error, Result, DEFAULT_MODE};

pub const S: u16 = 0;
pub const W: u16 = 1;
pub const X: u16 = 2;
pub const Q: u16 = 3;
pub const N: u16 = 4;

/// Largest array a bus uses
pub const MAX_SEMAPHORES: usize = 5;

#[cfg(target_os = "linux")]
mod consts {
    use libc::{c_int, c_short};

    pub const SEM_UNDO: c_short = 0x1000;
    pub const GETVAL: c_int = 12;
    pub const SETVAL: c_int = 16;
    pub const SETALL: c_int = 17;
}

use consts::{GETVAL, SETALL, SETVAL, SEM_UNDO};

/// What a signal arriving during a blocking wait does
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Surface the signal as [`Error::Interrupted`]
    #[default]
    Fail,
    /// Reissue the wait, recomputing the remaining time of timed waits
    Retry,
}

/// How long a semaphore operation may block
#[derive(Debug, Clone, Copy)]
pub enum Wait<'a> {
    Block,
    NoWait,
    Until(&'a Deadline),
}

/// A single adjustment of one semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    num: u16,
    delta: i16,
    undo: bool,
}

impl Op {
    /// Decrease by one, waiting while the value is zero
    pub const fn acquire(num: u16) -> Self {
        Self { num, delta: -1, undo: false }
    }

    /// Increase by one
    pub const fn release(num: u16) -> Self {
        Self { num, delta: 1, undo: false }
    }

    /// Wait for the value to become zero
    pub const fn zero(num: u16) -> Self {
        Self { num, delta: 0, undo: false }
    }

    /// Let the kernel revert this adjustment if the process exits
    pub const fn undo(self) -> Self {
        Self { undo: true, ..self }
    }

    const fn inverse(self) -> Self {
        Self { delta: -self.delta, ..self }
    }

    fn sembuf(self, nowait: bool) -> sembuf {
        let mut flags: c_short = 0;
        if self.undo {
            flags |= SEM_UNDO;
        }
        if nowait {
            flags |= libc::IPC_NOWAIT as c_short;
        }
        sembuf {
            sem_num: self.num,
            sem_op: self.delta,
            sem_flg: flags,
        }
    }
}

pub struct SemaphoreSet {
    id: c_int,
    key: key_t,
    count: u16,
    is_initiator: bool,
}

impl SemaphoreSet {
    /// Creates an array of `count` semaphores under a fresh random key
    ///
    /// All semaphores start at zero except [`X`]. The array is removed again
    /// when the returned value is dropped, unless [`persist`](Self::persist)
    /// was called.
    pub fn create(count: u16, rng: &mut impl Rng) -> Result<Self> {
        let (key, id) = handle::probe_key(rng, "semget", |key| unsafe {
            libc::semget(key, c_int::from(count), libc::IPC_CREAT | libc::IPC_EXCL | DEFAULT_MODE as c_int)
        })?;

        let set = Self {
            id,
            key,
            count,
            is_initiator: true,
        };

        let mut values = [0u16; MAX_SEMAPHORES];
        values[X as usize] = 1;
        unsafe { libc::semctl(id, 0, SETALL, values.as_mut_ptr()) }.r("semctl(SETALL)")?;

        debug!(key, id, count, "created semaphore array");
        Ok(set)
    }

    /// Opens the existing array registered under `key`
    pub fn open(key: key_t) -> Result<Self> {
        let id = unsafe { libc::semget(key, 0, 0) };
        if id == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::Removed,
                _ => Error::os("semget", err),
            });
        }

        let mut set = Self {
            id,
            key,
            count: 0,
            is_initiator: false,
        };
        set.count = set.stat()?.sem_nsems as u16;
        Ok(set)
    }

    pub fn key(&self) -> key_t {
        self.key
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// Keeps the array alive after this value is dropped
    pub fn persist(&mut self) {
        self.is_initiator = false;
    }

    pub fn remove(mut self) -> Result<()> {
        self.is_initiator = false;
        unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) }.r("semctl(IPC_RMID)")?;
        debug!(key = self.key, "removed semaphore array");
        Ok(())
    }

    pub fn value(&self, num: u16) -> Result<c_int> {
        unsafe { libc::semctl(self.id, c_int::from(num), GETVAL) }.r("semctl(GETVAL)")
    }

    pub fn set(&self, num: u16, value: c_int) -> Result<()> {
        trace!(id = self.id, num, value, "semctl(SETVAL)");
        unsafe { libc::semctl(self.id, c_int::from(num), SETVAL, value) }.r("semctl(SETVAL)")?;
        Ok(())
    }

    /// Performs `ops` as one atomic step
    ///
    /// Either every operation is applied or, while any of them would block,
    /// none is.
    pub fn apply(&self, ops: &[Op], wait: Wait<'_>, interrupt: Interrupt) -> Result<()> {
        let nowait = matches!(wait, Wait::NoWait);
        let mut bufs = [sembuf {
            sem_num: 0,
            sem_op: 0,
            sem_flg: 0,
        }; MAX_SEMAPHORES + 2];
        let bufs = &mut bufs[..ops.len()];
        for (buf, op) in bufs.iter_mut().zip(ops) {
            *buf = op.sembuf(nowait);
        }

        loop {
            let timeout = match wait {
                Wait::Until(deadline) => Some(deadline.remaining()?),
                Wait::Block | Wait::NoWait => None,
            };
            trace!(id = self.id, ?ops, ?timeout, "semop");

            let rc = match timeout {
                None => unsafe { libc::semop(self.id, bufs.as_mut_ptr(), bufs.len()) },
                Some(timeout) => unsafe { semtimedop(self.id, bufs, timeout) },
            };
            if rc == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            let err = match err.raw_os_error() {
                Some(libc::EINTR) if interrupt == Interrupt::Retry => continue,
                Some(libc::EINTR) => Error::Interrupted,
                Some(libc::EAGAIN) if timeout.is_some() => Error::TimedOut,
                Some(libc::EAGAIN) => Error::WouldBlock,
                Some(libc::EIDRM | libc::EINVAL) => Error::Removed,
                _ => Error::os("semop", err),
            };
            return Err(err);
        }
    }

    /// Applies `op` and returns a guard that reverts it unless completed
    pub fn hold(&self, op: Op, wait: Wait<'_>, interrupt: Interrupt) -> Result<Held<'_>> {
        self.apply(&[op], wait, interrupt)?;
        Ok(Held::new(self, op))
    }

    fn stat(&self) -> Result<semid_ds> {
        let mut ds: semid_ds = unsafe { std::mem::zeroed() };
        unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, &raw mut ds) }.r("semctl(IPC_STAT)")?;
        Ok(ds)
    }

    fn update(&self, edit: impl FnOnce(&mut libc::ipc_perm)) -> Result<()> {
        let mut ds = self.stat()?;
        edit(&mut ds.sem_perm);
        unsafe { libc::semctl(self.id, 0, libc::IPC_SET, &raw mut ds) }.r("semctl(IPC_SET)")?;
        Ok(())
    }

    /// Permission bits of the array
    pub fn mode(&self) -> Result<u32> {
        Ok(u32::from(self.stat()?.sem_perm.mode) & 0o777)
    }

    pub fn set_mode(&self, mode: u32) -> Result<()> {
        self.update(|perm| perm.mode = mode as _)
    }

    /// Owning user and group of the array
    pub fn owner(&self) -> Result<(u32, u32)> {
        let perm = self.stat()?.sem_perm;
        Ok((perm.uid, perm.gid))
    }

    pub fn set_owner(&self, uid: u32, gid: u32) -> Result<()> {
        self.update(|perm| {
            perm.uid = uid;
            perm.gid = gid;
        })
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        if self.is_initiator {
            let _ = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        }
    }
}

unsafe fn semtimedop(id: c_int, bufs: &mut [sembuf], timeout: Duration) -> c_int {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as _,
        tv_nsec: timeout.subsec_nanos() as _,
    };
    libc::syscall(
        libc::SYS_semtimedop,
        id,
        bufs.as_mut_ptr(),
        bufs.len(),
        &raw const ts,
    ) as c_int
}

/// An applied operation that still has to be reverted
///
/// Dropping the guard reverts the operation, retrying on signals and logging
/// failures. [`complete`](Held::complete) reverts it on the success path and
/// reports the outcome; if that fails the guard stays armed and the drop
/// tries once more.
#[must_use]
pub struct Held<'a> {
    set: &'a SemaphoreSet,
    op: Op,
    armed: bool,
}

impl<'a> Held<'a> {
    /// Takes responsibility for reverting `op`, which must already be applied
    pub(crate) fn new(set: &'a SemaphoreSet, op: Op) -> Self {
        Self { set, op, armed: true }
    }

    pub fn complete(mut self, wait: Wait<'_>, interrupt: Interrupt) -> Result<()> {
        self.set.apply(&[self.op.inverse()], wait, interrupt)?;
        self.armed = false;
        Ok(())
    }

    /// Drops the guard without reverting, for when a later atomic step
    /// already took the adjustment back
    pub(crate) fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let op = self.op.inverse();
        if let Err(err) = self.set.apply(&[op], Wait::Block, Interrupt::Retry) {
            warn!(id = self.set.id, ?op, %err, "failed to unwind semaphore");
        }
    }
}
