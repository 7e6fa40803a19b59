/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The transport core of an AMQP 1.0 stack: connection establishment and
//! teardown, link attach and detach, and credit-based flow control.
//!
//! # Layers
//!
//! * [`frame`] reads and writes the protocol header and frame envelope.
//! * [`performative`] defines the control payloads and the [`Codec`] seam
//!   used to put them on the wire.
//! * [`outbound`] serializes writes onto one stream, control frames first.
//! * [`connection`] runs the header and Open/Close handshakes, keeps the
//!   heartbeat, demultiplexes channels, and tracks established
//!   connections in a [`ConnectionRegistry`].
//! * [`link`] runs the Attach/Detach handshake and the flow endpoints
//!   that move messages under link credit.
//! * [`transport`] binds connections to TCP.
//!
//! # Concurrency
//!
//! Connections and links are protocol actors without threads of their
//! own. Every entry point queues an event; whichever caller finds the
//! actor idle processes the queue, performing I/O with no lock held.
//! Socket writes, heartbeats and credit nudges run as tasks on the
//! runtime registered with [`initialize`], or the current runtime if none
//! was.
//!
//! | Entity     | Log id               |
//! |------------|----------------------|
//! | Connection | `conn-<seq>:<remote>` |
//! | Link       | `link[<name>/<handle>]` |

mod actor;
pub mod config;
pub mod connection;
pub mod frame;
mod heartbeat;
mod init;
pub mod link;
pub mod outbound;
pub mod performative;
pub mod transport;

pub use actor::WaitError;
pub use config::Config;
pub use connection::Connection;
pub use connection::ConnectionError;
pub use connection::ConnectionKey;
pub use connection::ConnectionOptions;
pub use connection::ConnectionRegistry;
pub use connection::ConnectionState;
pub use init::initialize;
pub use init::initialize_logging;
pub use init::initialize_with_current_runtime;
pub use init::set_tracing_env_filter;
pub use link::CreditNudger;
pub use link::CreditPolicy;
pub use link::Link;
pub use link::LinkError;
pub use link::LinkOptions;
pub use link::LinkState;
pub use link::LinkTracker;
pub use performative::Codec;
pub use performative::ErrorCondition;
pub use performative::Performative;
pub use transport::Acceptor;
pub use transport::connect;
