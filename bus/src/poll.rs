//! Caller-driven reading, one message per call.

use std::{ffi::CStr, mem};

use crate::{
    sem::{Held, Op, Wait, Q},
    Bus, Deadline, Result, WaitPolicy,
};

/// Where a poller stands between two calls
enum State<'a> {
    /// Registered, nothing consumed since
    Registered(Held<'a>),
    /// Registered and holding the last message
    Consumed(Held<'a>),
    /// Done with the last message but not registered again; holds `W`
    Pending(Held<'a>),
    Unregistered,
}

/// A registered reader that receives messages on demand
///
/// Returned by [`Bus::poll_start`]. Dropping it deregisters the reader.
pub struct Poller<'a> {
    bus: &'a Bus,
    state: State<'a>,
    policy: WaitPolicy,
}

impl Bus {
    /// Registers a reader for manual polling
    ///
    /// With [`WaitPolicy::NoWait`], [`Poller::poll`] fails with
    /// [`Error::WouldBlock`](crate::Error::WouldBlock) instead of waiting
    /// for a broadcast.
    pub fn poll_start(&self, policy: WaitPolicy) -> Result<Poller<'_>> {
        self.poll_start_with(policy, Wait::Block)
    }

    pub fn poll_start_timed(&self, policy: WaitPolicy, deadline: &Deadline) -> Result<Poller<'_>> {
        self.poll_start_with(policy, Wait::Until(deadline))
    }

    fn poll_start_with(&self, policy: WaitPolicy, wait: Wait<'_>) -> Result<Poller<'_>> {
        let registration = self.register(wait)?;
        Ok(Poller {
            bus: self,
            state: State::Registered(registration),
            policy,
        })
    }
}

impl<'a> Poller<'a> {
    /// Waits for the next broadcast
    ///
    /// The message stays valid until the next call on this poller.
    pub fn poll(&mut self) -> Result<&CStr> {
        self.poll_with(Wait::Block)
    }

    /// Like [`poll`](Self::poll), with a deadline
    ///
    /// A poller that times out while registering again keeps later writers
    /// waiting, so the next call still receives the following broadcast.
    pub fn poll_timed(&mut self, deadline: &Deadline) -> Result<&CStr> {
        self.poll_with(Wait::Until(deadline))
    }

    fn poll_with(&mut self, wait: Wait<'_>) -> Result<&CStr> {
        let bus = self.bus;
        let registration = match mem::replace(&mut self.state, State::Unregistered) {
            State::Registered(registration) => registration,
            State::Consumed(registration) => {
                let pending = bus.consumed(registration)?;
                self.resume(pending, wait)?
            }
            State::Pending(pending) => self.resume(pending, wait)?,
            State::Unregistered => bus.register(wait)?,
        };

        let message_wait = match self.policy {
            WaitPolicy::Block => wait,
            WaitPolicy::NoWait => Wait::NoWait,
        };
        if let Err(err) = bus.sems.apply(&[Op::zero(Q)], message_wait, bus.interrupt) {
            self.state = State::Registered(registration);
            return Err(err);
        }
        self.state = State::Consumed(registration);
        bus.memory.message()
    }

    fn resume(&mut self, pending: Held<'a>, wait: Wait<'_>) -> Result<Held<'a>> {
        match self.bus.resume(wait) {
            Ok(registration) => {
                pending.forget();
                Ok(registration)
            }
            Err(err) => {
                self.state = State::Pending(pending);
                Err(err)
            }
        }
    }

    /// Deregisters the reader
    pub fn stop(mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Unregistered) {
            State::Registered(held) | State::Consumed(held) | State::Pending(held) => {
                held.complete(Wait::NoWait, self.bus.interrupt)
            }
            State::Unregistered => Ok(()),
        }
    }
}
