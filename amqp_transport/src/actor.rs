/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Single-flight, queue-draining state machines.
//!
//! Connections and links are driven by a [`SerialActor`]: a mutex-guarded
//! mailbox plus a `processing` flag. Every externally triggered event is
//! appended to the mailbox; the caller that finds the actor idle becomes
//! the draining thread and processes events until the mailbox is empty.
//! Other callers return immediately after enqueueing. No thread is owned
//! by an actor, and exactly one thread runs its logic at a time.
//!
//! Each event is checked against the protocol's transition table while the
//! lock is held. A valid transition may synthesize follow-up events and
//! name I/O actions; actions run with the lock released, and the state
//! change is committed once they return. Outcomes of actions (e.g. a
//! failed write) come back as new events.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::sync::watch;

/// Errors returned by the wait-for-state helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The caller-supplied deadline elapsed first.
    #[error("timed out waiting for state")]
    Timeout,
    /// The actor reached a state from which the awaited state is
    /// unreachable.
    #[error("terminated before reaching the awaited state")]
    Terminated,
}

/// The result of looking up an event in a transition table.
#[derive(Debug, PartialEq)]
pub(crate) struct Transition<S, E, A> {
    pub(crate) next: S,
    /// Follow-up events, processed before anything already queued.
    pub(crate) synthesized: Vec<E>,
    /// I/O performed with the lock released, in order.
    pub(crate) actions: Vec<A>,
}

impl<S, E, A> Transition<S, E, A> {
    pub(crate) fn to(next: S) -> Self {
        Self {
            next,
            synthesized: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub(crate) fn then(mut self, event: E) -> Self {
        self.synthesized.push(event);
        self
    }

    pub(crate) fn act(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }
}

/// A protocol state machine driven by a [`SerialActor`].
pub(crate) trait Protocol: Send + Sync + 'static {
    type State: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    type Event: fmt::Debug + Send + 'static;
    type Action: fmt::Debug + Send + 'static;

    /// Identifies the actor in logs.
    fn log_id(&self) -> &str;

    /// Look up `event` in the transition table for `state`. Events that
    /// are not valid in `state` are handed back.
    ///
    /// Called with the actor's lock held; must not call back into the actor.
    #[allow(clippy::type_complexity)]
    fn transition(
        &self,
        state: Self::State,
        event: Self::Event,
    ) -> Result<Transition<Self::State, Self::Event, Self::Action>, Self::Event>;

    /// Perform an action. Called without the lock held. A returned event is
    /// processed next.
    fn perform(&self, action: Self::Action) -> Option<Self::Event>;
}

struct Mailbox<S, E> {
    current: S,
    queue: VecDeque<E>,
    processing: bool,
    // Bumped by `reset`, so that a transition whose actions were running
    // during the reset is not committed afterwards.
    epoch: u64,
}

/// Drives a [`Protocol`] from whichever thread posts events.
pub(crate) struct SerialActor<P: Protocol> {
    protocol: P,
    mailbox: Mutex<Mailbox<P::State, P::Event>>,
    state: watch::Sender<P::State>,
}

impl<P: Protocol> fmt::Debug for SerialActor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mailbox = self.mailbox.lock().unwrap();
        f.debug_struct("SerialActor")
            .field("log_id", &self.protocol.log_id())
            .field("state", &mailbox.current)
            .field("queued", &mailbox.queue.len())
            .field("processing", &mailbox.processing)
            .finish()
    }
}

impl<P: Protocol> SerialActor<P> {
    pub(crate) fn new(protocol: P, initial: P::State) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            protocol,
            mailbox: Mutex::new(Mailbox {
                current: initial,
                queue: VecDeque::new(),
                processing: false,
                epoch: 0,
            }),
            state,
        }
    }

    pub(crate) fn protocol(&self) -> &P {
        &self.protocol
    }

    pub(crate) fn state(&self) -> P::State {
        self.mailbox.lock().unwrap().current
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<P::State> {
        self.state.subscribe()
    }

    /// Enqueue `event`, and drain the mailbox unless another thread
    /// already is.
    pub(crate) fn post(&self, event: P::Event) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.queue.push_back(event);
        if mailbox.processing {
            // The draining thread checks the queue under this lock before
            // it stops, so it will see this event.
            return;
        }
        mailbox.processing = true;
        self.drain(mailbox);
    }

    /// Force the actor into `state`, discarding queued events. Returns the
    /// number of events discarded.
    pub(crate) fn reset(&self, state: P::State) -> usize {
        let mut mailbox = self.mailbox.lock().unwrap();
        let discarded = mailbox.queue.len();
        mailbox.queue.clear();
        mailbox.epoch += 1;
        self.commit(&mut mailbox, state);
        discarded
    }

    fn drain<'a>(&'a self, mut mailbox: MutexGuard<'a, Mailbox<P::State, P::Event>>) {
        loop {
            let Some(event) = mailbox.queue.pop_front() else {
                mailbox.processing = false;
                return;
            };
            let current = mailbox.current;
            let Transition {
                next,
                synthesized,
                actions,
            } = match self.protocol.transition(current, event) {
                Ok(transition) => transition,
                Err(event) => {
                    tracing::warn!(
                        log_id = self.protocol.log_id(),
                        state = ?current,
                        event = ?event,
                        "event not valid in state; dropping"
                    );
                    continue;
                }
            };

            let mut follow_ups: Vec<P::Event> = Vec::new();
            if !actions.is_empty() {
                let epoch = mailbox.epoch;
                drop(mailbox);
                for action in actions {
                    tracing::trace!(
                        log_id = self.protocol.log_id(),
                        action = ?action,
                        "performing action"
                    );
                    follow_ups.extend(self.protocol.perform(action));
                }
                mailbox = self.mailbox.lock().unwrap();
                if mailbox.epoch != epoch {
                    tracing::debug!(
                        log_id = self.protocol.log_id(),
                        from = ?current,
                        to = ?next,
                        "actor reset while acting; transition not committed"
                    );
                    continue;
                }
            }

            self.commit(&mut mailbox, next);
            follow_ups.extend(synthesized);
            for event in follow_ups.into_iter().rev() {
                mailbox.queue.push_front(event);
            }
        }
    }

    fn commit(&self, mailbox: &mut Mailbox<P::State, P::Event>, next: P::State) {
        if mailbox.current == next {
            return;
        }
        tracing::debug!(
            log_id = self.protocol.log_id(),
            from = ?mailbox.current,
            to = ?next,
            "state transition"
        );
        mailbox.current = next;
        self.state.send_replace(next);
    }

    /// Wait until `done` holds for the current state, returning that state.
    pub(crate) async fn wait_for(
        &self,
        mut done: impl FnMut(P::State) -> bool,
        timeout: Option<Duration>,
    ) -> Result<P::State, WaitError> {
        let mut state = self.state.subscribe();
        let wait = async move {
            #[allow(clippy::let_and_return)]
            let result = state.wait_for(|state| done(*state)).await.map(|state| *state);
            result
        };
        match timeout {
            // The sender lives as long as `self`, so the wait cannot fail.
            None => wait.await.map_err(|_| WaitError::Terminated),
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| WaitError::Timeout)?
                .map_err(|_| WaitError::Terminated),
        }
    }
}
