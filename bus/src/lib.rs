//! Single-writer, multi-reader message bus over System-V IPC.
//!
//! A bus is a semaphore array plus a shared memory segment, found through a
//! small handle file holding both keys. Writers broadcast one NUL-terminated
//! message at a time and every reader that was registered when the message
//! was published receives it before the next writer may proceed.

use libc::c_int;

pub mod admin;
pub mod deadline;
pub mod error;
pub mod handle;
pub mod poll;
pub mod protocol;
pub mod resource;
pub mod sem;
pub mod shm;

pub use admin::{chmod, chown};
pub use deadline::{Clock, Deadline};
pub use error::{Error, Result};
pub use handle::Keys;
pub use poll::Poller;
pub use protocol::{Access, Bus, Event, Flow, SyncMode, WaitPolicy};
pub use resource::{create, unlink, CreateOptions};
pub use sem::Interrupt;

/// Size of the shared segment, including the terminating NUL
pub const BUS_MEMORY_SIZE: usize = 2048;

/// Permission bits of freshly created buses
pub const DEFAULT_MODE: u32 = 0o600;

pub(crate) trait CheckOk<R> {
    fn r(self, op: &'static str) -> Result<R>;
}

impl CheckOk<c_int> for c_int {
    fn r(self, op: &'static str) -> Result<c_int> {
        if self == -1 {
            return Err(Error::last_os(op));
        }
        Ok(self)
    }
}
