use std::{ffi::CStr, io, ptr::NonNull, slice};

use libc::{c_int, c_void, key_t, shmid_ds};
use rand::Rng;
use tracing::debug;

use crate::{handle, CheckOk, Error, Result, BUS_MEMORY_SIZE, DEFAULT_MODE};

/// The System-V shared memory segment a bus stores its message in
pub struct Segment {
    id: c_int,
    key: key_t,
    is_initiator: bool,
}

impl Segment {
    /// Creates a zeroed segment of [`BUS_MEMORY_SIZE`] bytes under a fresh
    /// random key, removed again on drop unless persisted
    pub fn create(rng: &mut impl Rng) -> Result<Self> {
        let (key, id) = handle::probe_key(rng, "shmget", |key| unsafe {
            libc::shmget(
                key,
                BUS_MEMORY_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | DEFAULT_MODE as c_int,
            )
        })?;
        debug!(key, id, "created shared memory");
        Ok(Self {
            id,
            key,
            is_initiator: true,
        })
    }

    pub fn open(key: key_t) -> Result<Self> {
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::Removed,
                _ => Error::os("shmget", err),
            });
        }
        Ok(Self {
            id,
            key,
            is_initiator: false,
        })
    }

    pub fn key(&self) -> key_t {
        self.key
    }

    pub fn persist(&mut self) {
        self.is_initiator = false;
    }

    pub fn attach(&self, read_only: bool) -> Result<Attachment> {
        let flags = if read_only { libc::SHM_RDONLY } else { 0 };
        let addr = unsafe { libc::shmat(self.id, std::ptr::null(), flags) };
        if addr as isize == -1 {
            return Err(Error::last_os("shmat"));
        }
        let addr = NonNull::new(addr.cast()).ok_or_else(|| Error::last_os("shmat"))?;
        Ok(Attachment {
            addr,
            read_only,
            #[cfg(test)]
            shm_id: self.id,
        })
    }

    pub fn remove(mut self) -> Result<()> {
        self.is_initiator = false;
        unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) }
            .r("shmctl(IPC_RMID)")?;
        debug!(key = self.key, "removed shared memory");
        Ok(())
    }

    fn stat(&self) -> Result<shmid_ds> {
        let mut ds: shmid_ds = unsafe { std::mem::zeroed() };
        unsafe { libc::shmctl(self.id, libc::IPC_STAT, &raw mut ds) }.r("shmctl(IPC_STAT)")?;
        Ok(ds)
    }

    fn update(&self, edit: impl FnOnce(&mut libc::ipc_perm)) -> Result<()> {
        let mut ds = self.stat()?;
        edit(&mut ds.shm_perm);
        unsafe { libc::shmctl(self.id, libc::IPC_SET, &raw mut ds) }.r("shmctl(IPC_SET)")?;
        Ok(())
    }

    pub fn mode(&self) -> Result<u32> {
        Ok(u32::from(self.stat()?.shm_perm.mode) & 0o777)
    }

    pub fn set_mode(&self, mode: u32) -> Result<()> {
        self.update(|perm| perm.mode = mode as _)
    }

    pub fn owner(&self) -> Result<(u32, u32)> {
        let perm = self.stat()?.shm_perm;
        Ok((perm.uid, perm.gid))
    }

    pub fn set_owner(&self, uid: u32, gid: u32) -> Result<()> {
        self.update(|perm| {
            perm.uid = uid;
            perm.gid = gid;
        })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.is_initiator {
            let _ = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        }
    }
}

/// A mapping of a [`Segment`] into this process, detached on drop
pub struct Attachment {
    addr: NonNull<u8>,
    read_only: bool,
    #[cfg(test)]
    shm_id: c_int,
}

unsafe impl Send for Attachment {}

impl Attachment {
    fn bytes(&self) -> &[u8] {
        // Safety: the mapping stays valid until detached and is
        // BUS_MEMORY_SIZE bytes long
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), BUS_MEMORY_SIZE) }
    }

    /// The message currently stored in the segment
    pub fn message(&self) -> Result<&CStr> {
        CStr::from_bytes_until_nul(self.bytes()).map_err(|_| Error::Unterminated)
    }

    #[cfg(test)]
    pub(crate) fn shm_id(&self) -> c_int {
        self.shm_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Copies `message` and a terminating NUL into the segment
    pub fn store(&self, message: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if message.len() + 1 > BUS_MEMORY_SIZE {
            return Err(Error::MessageTooLong {
                len: message.len(),
                capacity: BUS_MEMORY_SIZE,
            });
        }

        #[cfg(test)]
        let _counted = store_count::enter(self.shm_id);

        // Safety: the length was checked against the mapping above
        unsafe {
            let dst = self.addr.as_ptr();
            std::ptr::copy_nonoverlapping(message.as_ptr(), dst, message.len());
            *dst.add(message.len()) = 0;
        }
        Ok(())
    }

    pub fn detach(self) -> Result<()> {
        let addr = self.addr;
        std::mem::forget(self);
        unsafe { libc::shmdt(addr.as_ptr().cast::<c_void>()) }.r("shmdt")?;
        Ok(())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let _ = unsafe { libc::shmdt(self.addr.as_ptr().cast::<c_void>()) };
    }
}

/// Tracks how many writers are inside `store` at once, per segment
#[cfg(test)]
pub(crate) mod store_count {
    use std::{
        collections::HashMap,
        sync::{Mutex, OnceLock},
    };

    use libc::c_int;

    struct Counters {
        active: HashMap<c_int, usize>,
        peak: HashMap<c_int, usize>,
    }

    fn counters() -> &'static Mutex<Counters> {
        static COUNTERS: OnceLock<Mutex<Counters>> = OnceLock::new();
        COUNTERS.get_or_init(|| {
            Mutex::new(Counters {
                active: HashMap::new(),
                peak: HashMap::new(),
            })
        })
    }

    pub struct Guard(c_int);

    pub fn enter(id: c_int) -> Guard {
        let mut counters = counters().lock().unwrap();
        let active = counters.active.entry(id).or_default();
        *active += 1;
        let active = *active;
        let peak = counters.peak.entry(id).or_default();
        *peak = (*peak).max(active);
        // widen the window a concurrent writer would have to overlap in
        drop(counters);
        std::thread::sleep(std::time::Duration::from_micros(200));
        Guard(id)
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            let mut counters = counters().lock().unwrap();
            if let Some(active) = counters.active.get_mut(&self.0) {
                *active -= 1;
            }
        }
    }

    pub fn peak(id: c_int) -> usize {
        counters().lock().unwrap().peak.get(&id).copied().unwrap_or(0)
    }
}
