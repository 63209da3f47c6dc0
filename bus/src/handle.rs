//! Handle files: the filesystem name of a bus.
//!
//! A handle file holds the semaphore key on its first line and the shared
//! memory key on its second, both in decimal.

use std::{
    env,
    fmt::Write as _,
    fs::{self, DirBuilder},
    io,
    os::{fd::OwnedFd, unix::fs::DirBuilderExt},
    path::{Path, PathBuf},
};

use arrayvec::ArrayString;
use libc::{c_int, key_t};
use rand::{distributions::Alphanumeric, Rng};
use rustix::{
    fs::{Mode, OFlags},
    io::Errno,
};
use tracing::debug;

use crate::{Error, Interrupt, Result};

/// Largest key handed out for new IPC objects
pub const KEY_MAX: key_t = (1 << 30) - 1;

/// Length of the random part of generated handle names
pub const SUFFIX_LEN: usize = 30;

/// The pair of IPC keys a handle file resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keys {
    pub sem: key_t,
    pub shm: key_t,
}

impl Keys {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| match err.kind() {
            io::ErrorKind::InvalidData => Error::MalformedHandle {
                path: path.to_owned(),
                reason: "not valid UTF-8".to_owned(),
            },
            _ => Error::os("read handle", err),
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedHandle {
            path: path.to_owned(),
            reason,
        };

        let mut lines = text.lines();
        let mut next = |what: &str| -> Result<key_t> {
            let line = lines
                .next()
                .ok_or_else(|| malformed(format!("missing {what} key")))?;
            line.trim()
                .parse()
                .map_err(|err| malformed(format!("{what} key {line:?}: {err}")))
        };

        let sem = next("semaphore")?;
        let shm = next("memory")?;
        Ok(Self { sem, shm })
    }

    pub fn encode(&self) -> String {
        format!("{}\n{}\n", self.sem, self.shm)
    }
}

pub fn random_key(rng: &mut impl Rng) -> key_t {
    rng.gen_range(1..=KEY_MAX)
}

/// Draws random keys until `get` creates an object under one of them
///
/// `get` follows the `*get(2)` convention: an id, or `-1` with `errno` set.
/// Collisions and interrupted calls draw a new key.
pub(crate) fn probe_key(
    rng: &mut impl Rng,
    op: &'static str,
    mut get: impl FnMut(key_t) -> c_int,
) -> Result<(key_t, c_int)> {
    loop {
        let key = random_key(rng);
        let id = get(key);
        if id != -1 {
            return Ok((key, id));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EEXIST | libc::EINTR) => continue,
            _ => return Err(Error::os(op, err)),
        }
    }
}

/// Directory generated handle files are placed under
pub fn runtime_dir() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("/run"),
    }
}

pub fn random_suffix(rng: &mut impl Rng) -> ArrayString<SUFFIX_LEN> {
    let mut suffix = ArrayString::new();
    for c in rng.sample_iter(Alphanumeric).take(SUFFIX_LEN) {
        suffix.push(char::from(c));
    }
    suffix
}

/// A handle file being created
///
/// The file is unlinked again on drop unless [`persist`](Self::persist) is
/// called, so a failed creation leaves nothing behind.
pub struct HandleFile {
    path: PathBuf,
    fd: OwnedFd,
    is_initiator: bool,
}

impl HandleFile {
    /// Exclusively creates `path`
    pub fn create(path: &Path) -> Result<Self> {
        match open_exclusive(path) {
            Ok(fd) => Ok(Self::new(path.to_owned(), fd)),
            Err(Errno::EXIST) => Err(Error::Exists(path.to_owned())),
            Err(err) => Err(Error::os("open handle", err)),
        }
    }

    /// Creates `<dir>/bus/random.<suffix>` under a fresh random name
    pub fn create_random(dir: &Path, rng: &mut impl Rng) -> Result<Self> {
        let dir = dir.join("bus");
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)
            .map_err(|err| Error::os("mkdir", err))?;

        let mut name = String::with_capacity(7 + SUFFIX_LEN);
        loop {
            name.clear();
            let _ = write!(name, "random.{}", random_suffix(rng));
            let path = dir.join(&name);
            match open_exclusive(&path) {
                Ok(fd) => return Ok(Self::new(path, fd)),
                Err(Errno::EXIST) => continue,
                Err(err) => return Err(Error::os("open handle", err)),
            }
        }
    }

    fn new(path: PathBuf, fd: OwnedFd) -> Self {
        debug!(path = %path.display(), "created handle file");
        Self {
            path,
            fd,
            is_initiator: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_keys(&self, keys: &Keys, interrupt: Interrupt) -> Result<()> {
        let text = keys.encode();
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            match rustix::io::write(&self.fd, rest) {
                Ok(n) => rest = &rest[n..],
                Err(Errno::INTR) if interrupt == Interrupt::Retry => continue,
                Err(Errno::INTR) => return Err(Error::Interrupted),
                Err(err) => return Err(Error::os("write handle", err)),
            }
        }
        Ok(())
    }

    /// Keeps the file and returns its path
    pub fn persist(mut self) -> PathBuf {
        self.is_initiator = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for HandleFile {
    fn drop(&mut self) {
        if self.is_initiator {
            let _ = rustix::fs::unlink(self.path.as_path());
        }
    }
}

fn open_exclusive(path: &Path) -> rustix::io::Result<OwnedFd> {
    rustix::fs::open(
        path,
        OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
        Mode::RUSR | Mode::WUSR,
    )
}
