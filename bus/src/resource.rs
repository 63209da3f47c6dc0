use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    handle::{self, HandleFile},
    sem::SemaphoreSet,
    shm::Segment,
    Error, Interrupt, Keys, Result, SyncMode,
};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Fail with [`Error::Exists`] instead of succeeding when the explicit
    /// path is already taken
    pub exclusive: bool,
    /// Applies to writing the handle file; creation retries by default
    pub interrupt: Interrupt,
    pub mode: SyncMode,
    /// Overrides `$XDG_RUNTIME_DIR` when generating a path
    pub runtime_dir: Option<PathBuf>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            exclusive: false,
            interrupt: Interrupt::Retry,
            mode: SyncMode::default(),
            runtime_dir: None,
        }
    }
}

/// Creates a bus and returns the path of its handle file
///
/// Without `path` a random handle is generated under the runtime directory.
/// An existing `path` is taken as an already created bus unless
/// `options.exclusive` is set; its content is not checked.
pub fn create(path: Option<&Path>, options: &CreateOptions) -> Result<PathBuf> {
    let mut rng = rand::thread_rng();

    let file = match path {
        Some(path) => match HandleFile::create(path) {
            Err(Error::Exists(_)) if !options.exclusive => {
                debug!(path = %path.display(), "bus already exists");
                return Ok(path.to_owned());
            }
            res => res?,
        },
        None => {
            let dir = options.runtime_dir.clone().unwrap_or_else(handle::runtime_dir);
            HandleFile::create_random(&dir, &mut rng)?
        }
    };

    let mut sems = SemaphoreSet::create(options.mode.semaphores(), &mut rng)?;
    let mut segment = Segment::create(&mut rng)?;
    let keys = Keys {
        sem: sems.key(),
        shm: segment.key(),
    };
    file.write_keys(&keys, options.interrupt)?;

    sems.persist();
    segment.persist();
    let path = file.persist();
    info!(path = %path.display(), sem = keys.sem, shm = keys.shm, mode = ?options.mode, "created bus");
    Ok(path)
}

/// Removes the semaphore array, the segment and the handle file of a bus
///
/// All three are attempted; the first failure is reported.
pub fn unlink(path: &Path) -> Result<()> {
    let keys = Keys::read(path)?;

    let sems = SemaphoreSet::open(keys.sem).and_then(SemaphoreSet::remove);
    let segment = Segment::open(keys.shm).and_then(Segment::remove);
    let file = fs::remove_file(path).map_err(|err| Error::os("unlink", err));

    info!(path = %path.display(), "removed bus");
    sems.and(segment).and(file)
}
