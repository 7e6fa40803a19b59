/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The connection state machine's transition table.

use crate::actor::Transition;
use crate::frame::validate_header;
use crate::performative::Close;
use crate::performative::ErrorCondition;
use crate::performative::Open;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing sent or received.
    Start,
    /// Our protocol header is out; the peer's is not in yet.
    HdrSent,
    /// The peer's header arrived first; ours is about to be echoed.
    HdrRcvd,
    /// Headers exchanged.
    HdrExch,
    /// Our Open is out.
    OpenSent,
    /// The peer's Open arrived first; ours is about to be sent.
    OpenRcvd,
    /// Open requested before the peer's header arrived; it is sent once
    /// the header is validated.
    OpenPipe,
    /// Open and Close both requested before the peer's header arrived.
    OcPipe,
    /// Our Open and Close are out; the peer's Open is not in yet.
    ClosePipe,
    /// Open exchange complete.
    Opened,
    /// Our Close is out.
    CloseSent,
    /// The peer's Close arrived; ours is about to be sent.
    CloseRcvd,
    /// Terminal.
    End,
}

impl ConnectionState {
    /// Whether the connection is finished.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::End
    }

    /// Whether frames on non-zero channels may be dispatched.
    pub fn carries_sessions(self) -> bool {
        matches!(self, ConnectionState::Opened | ConnectionState::CloseSent)
    }
}

/// Which side initiated the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// We connected.
    Active,
    /// We accepted.
    Passive,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConnectionEvent {
    SendHeader,
    HeaderReceived([u8; 8]),
    SendOpen,
    OpenReceived(Open),
    SendClose(Option<ErrorCondition>),
    CloseReceived(Close),
    /// The transport went away: peer disconnect, write failure or
    /// heartbeat expiry.
    Abort(String),
}

/// How a connection ends.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Teardown {
    /// Close exchange completed.
    Graceful,
    /// The peer broke protocol; flush what we have queued and hang up.
    Reject(String),
    /// The transport is unusable; discard what we have queued.
    Abort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConnectionAction {
    WriteHeader,
    WriteOpen,
    WriteClose(Option<ErrorCondition>),
    /// Stash the error for a Close written later.
    DeferClose(Option<ErrorCondition>),
    Negotiate(Open),
    Established,
    PeerClosed(Option<ErrorCondition>),
    Teardown(Teardown),
}

pub(crate) type ConnectionTransition =
    Transition<ConnectionState, ConnectionEvent, ConnectionAction>;

/// Look up `event` in the table for `state`.
pub(crate) fn transition(
    role: ConnectionRole,
    state: ConnectionState,
    event: ConnectionEvent,
) -> Result<ConnectionTransition, ConnectionEvent> {
    use ConnectionAction as A;
    use ConnectionEvent as E;
    use ConnectionState::*;

    let t = Transition::to;
    Ok(match (state, event) {
        (End, event) => return Err(event),

        (_, E::Abort(reason)) => t(End).act(A::Teardown(Teardown::Abort(reason))),

        (Start | HdrSent | OpenPipe | OcPipe, E::HeaderReceived(header))
            if !validate_header(&header) =>
        {
            let reason = format!("invalid protocol header {:?}", header);
            // A passive side answers with the header it does support.
            if role == ConnectionRole::Passive && state == Start {
                t(End)
                    .act(A::WriteHeader)
                    .act(A::Teardown(Teardown::Reject(reason)))
            } else {
                t(End).act(A::Teardown(Teardown::Reject(reason)))
            }
        }

        // Header exchange.
        (Start, E::SendHeader) => t(HdrSent).act(A::WriteHeader),
        (Start, E::HeaderReceived(_)) => t(HdrRcvd).then(E::SendHeader),
        (HdrRcvd, E::SendHeader) => t(HdrExch).act(A::WriteHeader),
        (HdrSent, E::HeaderReceived(_)) => t(HdrExch),

        // Pipelined open and close ahead of the peer's header.
        (HdrSent, E::SendOpen) => t(OpenPipe),
        (OpenPipe, E::HeaderReceived(_)) => t(HdrExch).then(E::SendOpen),
        (OpenPipe, E::SendClose(error)) => t(OcPipe).act(A::DeferClose(error)),
        (OcPipe, E::HeaderReceived(_)) => t(HdrExch)
            .then(E::SendOpen)
            .then(E::SendClose(None)),

        // Open exchange.
        (HdrExch, E::SendOpen) => t(OpenSent).act(A::WriteOpen),
        (HdrExch, E::OpenReceived(open)) => t(OpenRcvd)
            .then(E::SendOpen)
            .act(A::Negotiate(open)),
        (OpenRcvd, E::SendOpen) => t(Opened).act(A::WriteOpen).act(A::Established),
        (OpenSent, E::OpenReceived(open)) => t(Opened)
            .act(A::Negotiate(open))
            .act(A::Established),

        // Close requested with our Open out but the peer's not in.
        (OpenSent, E::SendClose(error)) => t(ClosePipe).act(A::WriteClose(error)),
        (ClosePipe, E::OpenReceived(open)) => t(CloseSent).act(A::Negotiate(open)),
        (ClosePipe, E::CloseReceived(_)) => t(End).act(A::Teardown(Teardown::Graceful)),

        // Close exchange.
        (Opened | OpenRcvd, E::SendClose(error)) => t(CloseSent).act(A::WriteClose(error)),
        (Opened | OpenSent, E::CloseReceived(close)) => t(CloseRcvd)
            .then(E::SendClose(None))
            .act(A::PeerClosed(close.error)),
        (CloseRcvd, E::SendClose(error)) => t(End)
            .act(A::WriteClose(error))
            .act(A::Teardown(Teardown::Graceful)),
        (CloseSent, E::CloseReceived(_)) => t(End).act(A::Teardown(Teardown::Graceful)),

        // Closing before any Open went out abandons the handshake.
        (Start | HdrSent | HdrRcvd | HdrExch, E::SendClose(_)) => t(End).act(A::Teardown(
            Teardown::Abort("closed before open exchange".to_string()),
        )),

        (_, event) => return Err(event),
    })
}
