/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The link state machine's transition table.

use crate::actor::Transition;
use crate::performative::Attach;
use crate::performative::Detach;
use crate::performative::ErrorCondition;
use crate::performative::Role;
use crate::performative::condition;

/// Link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Not attached. Initial and terminal.
    Detached,
    /// Our Attach is out.
    AttachSent,
    /// The peer's Attach arrived first; ours is about to be sent.
    AttachRcvd,
    /// Both Attaches exchanged.
    Attached,
    /// Detach requested while our Attach was unanswered; waiting for the
    /// peer's Attach and then its Detach.
    DetachPipe,
    /// Our Detach is out.
    DetachSent,
    /// The peer's Detach arrived; ours is about to be sent.
    DetachRcvd,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkEvent {
    SendAttach,
    AttachReceived(Attach),
    SendDetach(Option<ErrorCondition>),
    DetachReceived(Detach),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkAction {
    WriteAttach,
    RecordPeer(Attach),
    /// Create the flow endpoint.
    Established,
    WriteDetach(Option<ErrorCondition>),
    PeerDetached(Option<ErrorCondition>),
    /// Drop the flow endpoint.
    Destroy,
}

pub(crate) type LinkTransition = Transition<LinkState, LinkEvent, LinkAction>;

fn role_mismatch(ours: Role) -> ErrorCondition {
    ErrorCondition::new(
        condition::NOT_ALLOWED,
        format!("peer attached as {:?} to a {:?} link", ours, ours),
    )
}

/// Look up `event` in the table for `state`. `role` is our role; a peer
/// attaching with the same role is answered and then detached.
pub(crate) fn transition(
    role: Role,
    state: LinkState,
    event: LinkEvent,
) -> Result<LinkTransition, LinkEvent> {
    use LinkAction as A;
    use LinkEvent as E;
    use LinkState::*;

    let t = Transition::to;
    Ok(match (state, event) {
        (Detached, E::SendAttach) => t(AttachSent).act(A::WriteAttach),
        (Detached, E::AttachReceived(attach)) if attach.role == role => t(Attached)
            .then(E::SendDetach(Some(role_mismatch(role))))
            .act(A::RecordPeer(attach))
            .act(A::WriteAttach),
        (Detached, E::AttachReceived(attach)) => t(AttachRcvd)
            .then(E::SendAttach)
            .act(A::RecordPeer(attach)),
        (AttachRcvd, E::SendAttach) => t(Attached).act(A::WriteAttach).act(A::Established),
        (AttachSent, E::AttachReceived(attach)) if attach.role == role => t(Attached)
            .then(E::SendDetach(Some(role_mismatch(role))))
            .act(A::RecordPeer(attach)),
        (AttachSent, E::AttachReceived(attach)) => t(Attached)
            .act(A::RecordPeer(attach))
            .act(A::Established),

        // Detach before the peer's Attach arrived.
        (AttachSent, E::SendDetach(error)) => t(DetachPipe).act(A::WriteDetach(error)),
        (DetachPipe, E::AttachReceived(attach)) => t(DetachSent).act(A::RecordPeer(attach)),

        (Attached, E::SendDetach(error)) => t(DetachSent).act(A::WriteDetach(error)),
        (Attached | AttachSent, E::DetachReceived(detach)) => t(DetachRcvd)
            .then(E::SendDetach(None))
            .act(A::PeerDetached(detach.error)),
        (DetachRcvd, E::SendDetach(error)) => t(Detached)
            .act(A::WriteDetach(error))
            .act(A::Destroy),
        (DetachSent | DetachPipe, E::DetachReceived(_)) => t(Detached).act(A::Destroy),

        (_, event) => return Err(event),
    })
}
