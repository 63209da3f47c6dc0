//! The broadcast rendezvous between one writer and its registered readers.
//!
//! A reader registers by raising `S` and `Q` together, then waits for `Q` to
//! drop to zero. A writer takes `X`, waits until no reader is between two
//! registrations (`W = 0`), stores its message, resets `Q` to wake every
//! registered reader at once and waits for `S` to drain as readers consume.
//!
//! After consuming, a reader swaps its `S` increment for a `W` increment in
//! one step, then swaps back while registering for the next message. The
//! second swap cannot happen while the current writer is still waiting on
//! `S`: in strict mode the writer raises `N` for that span, in relaxed mode
//! it still holds `X`. A reader therefore never re-enters `S` before its
//! peers leave it, and the next writer cannot start before every re-arming
//! reader is registered again.

use std::{ffi::CStr, path::Path};

use arrayvec::ArrayVec;
use tracing::{debug, trace};

use crate::{
    sem::{Held, Op, SemaphoreSet, Wait, N, Q, S, W, X},
    shm::{Attachment, Segment},
    Deadline, Error, Interrupt, Keys, Result, BUS_MEMORY_SIZE,
};

/// Which protocol variant a bus runs, fixed when it is created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Five semaphores; readers may not re-register while a writer waits
    /// for its readers
    #[default]
    Strict,
    /// Four semaphores; readers wait for the writer lock instead
    Relaxed,
}

impl SyncMode {
    pub fn semaphores(self) -> u16 {
        match self {
            SyncMode::Strict => 5,
            SyncMode::Relaxed => 4,
        }
    }

    pub fn from_count(count: u16) -> Option<Self> {
        match count {
            5 => Some(SyncMode::Strict),
            4 => Some(SyncMode::Relaxed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Whether the first wait of an operation may block
///
/// For writes this is the writer lock, for polls the wait for a message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    #[default]
    Block,
    NoWait,
}

/// What a reader callback is invoked with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// The reader is registered; every later broadcast will be delivered
    Ready,
    Message(&'a CStr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An open session on a bus
pub struct Bus {
    keys: Keys,
    pub(crate) sems: SemaphoreSet,
    pub(crate) memory: Attachment,
    mode: SyncMode,
    pub(crate) interrupt: Interrupt,
}

impl Bus {
    pub fn open(path: &Path, access: Access) -> Result<Self> {
        let keys = Keys::read(path)?;
        let sems = SemaphoreSet::open(keys.sem)?;
        let mode = SyncMode::from_count(sems.count()).ok_or_else(|| Error::MalformedHandle {
            path: path.to_owned(),
            reason: format!("semaphore array holds {} semaphores", sems.count()),
        })?;
        let memory = Segment::open(keys.shm)?.attach(access == Access::ReadOnly)?;

        debug!(path = %path.display(), ?mode, ?access, "opened bus");
        Ok(Self {
            keys,
            sems,
            memory,
            mode,
            interrupt: Interrupt::default(),
        })
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn keys(&self) -> Keys {
        self.keys
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn close(self) -> Result<()> {
        self.memory.detach()
    }

    /// Broadcasts `message` to every registered reader
    ///
    /// Returns once all of them consumed it. With [`WaitPolicy::NoWait`] the
    /// call fails with [`Error::WouldBlock`] instead of queueing behind
    /// another writer.
    pub fn write(&self, message: impl AsRef<[u8]>, policy: WaitPolicy) -> Result<()> {
        let lock_wait = match policy {
            WaitPolicy::Block => Wait::Block,
            WaitPolicy::NoWait => Wait::NoWait,
        };
        self.write_with(message.as_ref(), lock_wait, Wait::Block)
    }

    /// Like [`write`](Self::write), but gives up with [`Error::TimedOut`] at
    /// `deadline`
    ///
    /// The deadline bounds the writer lock and the wait for re-arming readers,
    /// so a timeout always leaves the segment untouched. Once the message is
    /// published the call waits for every woken reader regardless.
    pub fn write_timed(&self, message: impl AsRef<[u8]>, deadline: &Deadline) -> Result<()> {
        self.write_with(message.as_ref(), Wait::Until(deadline), Wait::Until(deadline))
    }

    fn check(&self, message: &[u8]) -> Result<()> {
        if self.memory.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if message.contains(&0) {
            return Err(Error::InteriorNul);
        }
        if message.len() + 1 > BUS_MEMORY_SIZE {
            return Err(Error::MessageTooLong {
                len: message.len(),
                capacity: BUS_MEMORY_SIZE,
            });
        }
        Ok(())
    }

    fn write_with(&self, message: &[u8], lock_wait: Wait<'_>, wait: Wait<'_>) -> Result<()> {
        self.check(message)?;
        let interrupt = self.interrupt;

        let lock = match self.mode {
            SyncMode::Strict => {
                let lock = self.sems.hold(Op::acquire(X).undo(), lock_wait, interrupt)?;
                self.sems.apply(&[Op::zero(W)], wait, interrupt)?;
                lock
            }
            SyncMode::Relaxed => {
                // taking X while readers re-arm would keep them from registering
                let lock = Op::acquire(X).undo();
                self.sems.apply(&[Op::zero(W), lock], lock_wait, interrupt)?;
                Held::new(&self.sems, lock)
            }
        };

        self.memory.store(message)?;
        trace!(len = message.len(), "stored message");

        let announce = match self.mode {
            SyncMode::Strict => Some(self.sems.hold(Op::release(N).undo(), Wait::NoWait, interrupt)?),
            SyncMode::Relaxed => None,
        };
        self.sems.set(Q, 0)?;
        // readers hold the message until S drains, so X must stay taken
        self.sems.apply(&[Op::zero(S)], Wait::Block, Interrupt::Retry)?;

        if let Some(announce) = announce {
            announce.complete(Wait::NoWait, interrupt)?;
        }
        lock.complete(Wait::NoWait, interrupt)
    }

    /// Receives broadcasts until `callback` asks to stop
    ///
    /// `callback` first sees [`Event::Ready`] once the reader is registered,
    /// then one [`Event::Message`] per broadcast. An error returned by the
    /// callback ends the loop as [`Error::Callback`].
    pub fn read<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(Event<'_>) -> anyhow::Result<Flow>,
    {
        self.read_with(callback, Wait::Block)
    }

    /// Like [`read`](Self::read), with every wait bounded by `deadline`
    ///
    /// The callback may already have run when the deadline passes.
    pub fn read_timed<F>(&self, callback: F, deadline: &Deadline) -> Result<()>
    where
        F: FnMut(Event<'_>) -> anyhow::Result<Flow>,
    {
        self.read_with(callback, Wait::Until(deadline))
    }

    fn read_with<F>(&self, mut callback: F, wait: Wait<'_>) -> Result<()>
    where
        F: FnMut(Event<'_>) -> anyhow::Result<Flow>,
    {
        let mut registration = self.register(wait)?;

        if callback(Event::Ready).map_err(Error::Callback)? == Flow::Stop {
            return registration.complete(Wait::NoWait, self.interrupt);
        }

        loop {
            self.sems.apply(&[Op::zero(Q)], wait, self.interrupt)?;
            let message = self.memory.message()?;
            match callback(Event::Message(message)).map_err(Error::Callback)? {
                Flow::Stop => return registration.complete(Wait::NoWait, self.interrupt),
                Flow::Continue => registration = self.rearm(registration, wait)?,
            }
        }
    }

    /// Registers a reader for the next broadcast, together with `extra`
    fn register_with(&self, extra: Option<Op>, wait: Wait<'_>) -> Result<Held<'_>> {
        let mut ops = ArrayVec::<Op, 5>::new();
        match self.mode {
            SyncMode::Strict => ops.push(Op::zero(N)),
            SyncMode::Relaxed => {
                ops.push(Op::acquire(X));
                ops.push(Op::release(X));
            }
        }
        ops.push(Op::release(S).undo());
        ops.push(Op::release(Q));
        ops.extend(extra);

        self.sems.apply(&ops, wait, self.interrupt)?;
        trace!(mode = ?self.mode, "registered reader");
        Ok(Held::new(&self.sems, Op::release(S).undo()))
    }

    pub(crate) fn register(&self, wait: Wait<'_>) -> Result<Held<'_>> {
        self.register_with(None, wait)
    }

    /// Swaps the reader's hold on `S` for a hold on `W` once it is done with
    /// a message
    ///
    /// The returned guard keeps the next writer from publishing until
    /// [`resume`](Self::resume) succeeds.
    pub(crate) fn consumed<'a>(&'a self, registration: Held<'a>) -> Result<Held<'a>> {
        let pending = Op::release(W).undo();
        self.sems
            .apply(&[Op::acquire(S).undo(), pending], Wait::NoWait, self.interrupt)?;
        registration.forget();
        Ok(Held::new(&self.sems, pending))
    }

    /// Registers a reader that holds `W` from [`consumed`](Self::consumed)
    ///
    /// On success the caller forgets its pending guard, since the
    /// registration already gave `W` back.
    pub(crate) fn resume(&self, wait: Wait<'_>) -> Result<Held<'_>> {
        self.register_with(Some(Op::acquire(W).undo()), wait)
    }

    /// Releases the reader's hold on `S` after a message and registers it
    /// again for the next one
    ///
    /// On failure the reader is left unregistered.
    pub(crate) fn rearm<'a>(&'a self, registration: Held<'a>, wait: Wait<'_>) -> Result<Held<'a>> {
        let pending = self.consumed(registration)?;
        let registration = self.resume(wait)?;
        pending.forget();
        Ok(registration)
    }
}

#[cfg(test)]
mod test {
    use std::{
        path::PathBuf,
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use super::{Access, Bus, Event, Flow, SyncMode, WaitPolicy};
    use crate::{create, sem::S, shm::store_count, unlink, Clock, CreateOptions, Deadline, Error};

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
    }

    impl Fixture {
        fn new(mode: SyncMode) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bus");
            let options = CreateOptions {
                mode,
                ..Default::default()
            };
            create(Some(&path), &options).unwrap();
            Self { _dir: dir, path }
        }

        fn open(&self) -> Bus {
            Bus::open(&self.path, Access::ReadWrite).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = unlink(&self.path);
        }
    }

    #[test]
    fn mode_follows_semaphore_count() {
        for mode in [SyncMode::Strict, SyncMode::Relaxed] {
            let fixture = Fixture::new(mode);
            assert_eq!(fixture.open().mode(), mode);
        }
    }

    #[test]
    fn rejects_bad_messages_before_locking() {
        let fixture = Fixture::new(SyncMode::Strict);
        let bus = fixture.open();
        assert!(matches!(bus.write(b"a\0b", WaitPolicy::Block), Err(Error::InteriorNul)));
        assert!(matches!(
            bus.write(vec![b'x'; 2048], WaitPolicy::Block),
            Err(Error::MessageTooLong { .. })
        ));

        let reader = Bus::open(&fixture.path, Access::ReadOnly).unwrap();
        assert!(matches!(reader.write("hi", WaitPolicy::Block), Err(Error::ReadOnly)));
    }

    #[test]
    fn write_without_readers_completes() {
        for mode in [SyncMode::Strict, SyncMode::Relaxed] {
            let fixture = Fixture::new(mode);
            let bus = fixture.open();
            bus.write("one", WaitPolicy::Block).unwrap();
            bus.write("two", WaitPolicy::NoWait).unwrap();
            assert_eq!(bus.memory.message().unwrap().to_bytes(), b"two");
        }
    }

    #[test]
    fn stop_on_ready_deregisters() {
        for mode in [SyncMode::Strict, SyncMode::Relaxed] {
            let fixture = Fixture::new(mode);
            let bus = fixture.open();
            let mut events = 0;
            bus.read(|event| {
                assert_eq!(event, Event::Ready);
                events += 1;
                Ok(Flow::Stop)
            })
            .unwrap();
            assert_eq!(events, 1);
            assert_eq!(bus.sems.value(S).unwrap(), 0);
        }
    }

    #[test]
    fn callback_error_deregisters() {
        let fixture = Fixture::new(SyncMode::Strict);
        let bus = fixture.open();
        let res = bus.read(|_| anyhow::bail!("nope"));
        assert!(matches!(res, Err(Error::Callback(_))));
        assert_eq!(bus.sems.value(S).unwrap(), 0);
    }

    #[test]
    fn blocked_writer_leaves_segment_alone() {
        for mode in [SyncMode::Strict, SyncMode::Relaxed] {
            let fixture = Fixture::new(mode);
            let reader = fixture.open();
            let mut poller = reader.poll_start(WaitPolicy::Block).unwrap();

            let first = fixture.open();
            let publisher = thread::spawn(move || first.write("first", WaitPolicy::Block));
            assert_eq!(poller.poll().unwrap().to_bytes(), b"first");

            let second = fixture.open();
            let deadline = Deadline::after(Clock::Monotonic, Duration::from_millis(100));
            assert!(matches!(second.write_timed("second", &deadline), Err(Error::TimedOut)));
            assert_eq!(second.memory.message().unwrap().to_bytes(), b"first");

            poller.stop().unwrap();
            publisher.join().unwrap().unwrap();
        }
    }

    #[test]
    fn at_most_one_writer() {
        for mode in [SyncMode::Strict, SyncMode::Relaxed] {
            let fixture = Fixture::new(mode);
            let writers = 8;
            let barrier = Arc::new(Barrier::new(writers));

            let handles: Vec<_> = (0..writers)
                .map(|i| {
                    let bus = fixture.open();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        for j in 0..20 {
                            bus.write(format!("{i}:{j}"), WaitPolicy::Block).unwrap();
                        }
                        bus.memory.shm_id()
                    })
                })
                .collect();

            for handle in handles {
                let id = handle.join().unwrap();
                assert_eq!(store_count::peak(id), 1);
            }
        }
    }
}
