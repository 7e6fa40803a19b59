/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connections.
//!
//! A [`Connection`] runs the header, Open and Close exchanges over one
//! transport, negotiates limits with its peer, keeps the transport alive
//! with heartbeats, and multiplexes channels: channel 0 carries connection
//! control, every other channel is dispatched to the [`ChannelHandler`]
//! that allocated it (or to the default session handler).
//!
//! All protocol events, whether they come from the application, the
//! reader task, the write task or the heartbeat task, are serialized
//! through a [`SerialActor`]. Writes go through the connection's
//! [`OutboundSender`].

mod registry;
mod state;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
pub use registry::ConnectionObserver;
pub use registry::ConnectionRegistry;
pub use state::ConnectionRole;
pub use state::ConnectionState;
use state::ConnectionAction;
use state::ConnectionEvent;
use state::ConnectionTransition;
use state::Teardown;
use tokio::io::AsyncWrite;
use tokio::sync::watch;

use crate::actor::Protocol;
use crate::actor::SerialActor;
use crate::actor::WaitError;
use crate::config::Config;
use crate::frame::FRAME_HEADER_LEN;
use crate::frame::Frame;
use crate::frame::MIN_MAX_FRAME_SIZE;
use crate::frame::compose_header;
use crate::frame::heartbeat_frame;
use crate::heartbeat::HeartbeatMonitor;
use crate::heartbeat::HeartbeatTarget;
use crate::heartbeat::Liveness;
use crate::init::get_runtime;
use crate::link::DELIVERY_TAG_LEN;
use crate::outbound::OutboundSender;
use crate::outbound::Priority;
use crate::outbound::SendError;
use crate::performative::BincodeCodec;
use crate::performative::Close;
use crate::performative::Codec;
use crate::performative::ErrorCondition;
use crate::performative::Open;
use crate::performative::Performative;
use crate::performative::Transfer;
use crate::performative::condition;

/// Errors from connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Establishing the transport failed.
    #[error("connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    /// Binding a listener failed.
    #[error("bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),
    /// Other transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Every negotiated channel is in use.
    #[error("all {0} channels in use")]
    ChannelsExhausted(u16),
    /// The operation needs a completed Open exchange.
    #[error("connection is {0:?}, not open")]
    NotOpen(ConnectionState),
    /// Waiting for the Open exchange failed.
    #[error("open exchange: {0}")]
    Wait(#[from] WaitError),
}

/// Identity of a connection: the remote host and the port of the
/// transport. Port 0 means "unknown" and matches any port.
#[derive(Debug, Clone, Eq)]
pub struct ConnectionKey {
    remote: String,
    port: u16,
}

impl ConnectionKey {
    /// A key matching any connection to `remote`.
    pub fn new(remote: impl Into<String>) -> Self {
        Self::with_port(remote, 0)
    }

    /// A key for `remote` on `port`.
    pub fn with_port(remote: impl Into<String>, port: u16) -> Self {
        Self {
            remote: remote.into(),
            port,
        }
    }

    /// The remote host.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// The port, or 0 if unknown.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.remote == other.remote
            && (self.port == 0 || other.port == 0 || self.port == other.port)
    }
}

impl Hash for ConnectionKey {
    // Ports may be wildcards, so only the remote participates.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remote.hash(state);
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.port)
    }
}

/// Limits in effect on a connection. Before the peer's Open arrives these
/// are our local limits; afterwards each is the smaller of ours and the
/// peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionProperties {
    /// Number of channels, including channel 0.
    pub max_channels: u16,
    /// Largest frame either side will send.
    pub max_frame_size: u32,
    /// Heartbeat interval. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
}

impl ConnectionProperties {
    /// Local limits from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_channels: config.channel_max,
            max_frame_size: config.max_frame_size.max(MIN_MAX_FRAME_SIZE),
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    fn negotiate(&mut self, peer: &Open) {
        self.max_channels = self.max_channels.min(peer.channel_max);
        self.max_frame_size = self
            .max_frame_size
            .min(peer.max_frame_size.max(MIN_MAX_FRAME_SIZE));
        let peer_interval = peer
            .idle_time_out
            .filter(|millis| *millis > 0)
            .map(|millis| Duration::from_millis(millis as u64));
        self.heartbeat_interval = match peer_interval {
            Some(peer) if self.heartbeat_interval.is_zero() => peer,
            Some(peer) => self.heartbeat_interval.min(peer),
            None => self.heartbeat_interval,
        };
    }
}

/// Receives the frames of the channels it is registered for.
pub trait ChannelHandler: Send + Sync + 'static {
    /// A frame arrived on `channel`.
    fn frame_received(&self, channel: u16, performative: Performative);

    /// The connection ended. `error` is set if it did not end normally.
    fn connection_closed(&self, _error: Option<&ErrorCondition>) {}
}

/// Something performatives can be sent through.
pub trait FrameSink: Send + Sync + 'static {
    /// Send `performative`.
    fn send(&self, performative: Performative) -> Result<(), SendError>;

    /// The largest transfer payload one frame can carry, if bounded.
    fn max_payload_size(&self) -> Option<usize> {
        None
    }
}

/// Sends frames on one allocated channel of a connection.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    connection: Weak<ConnectionInner>,
    channel: u16,
}

impl ChannelSender {
    /// The channel number.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// The connection, if it still exists.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(|inner| Connection { inner })
    }
}

impl FrameSink for ChannelSender {
    fn send(&self, performative: Performative) -> Result<(), SendError> {
        let Some(inner) = self.connection.upgrade() else {
            return Err(SendError::Closed);
        };
        inner.protocol().send_frame(self.channel, &performative)
    }

    fn max_payload_size(&self) -> Option<usize> {
        let inner = self.connection.upgrade()?;
        inner.protocol().max_transfer_payload(DELIVERY_TAG_LEN)
    }
}

/// Channel allocation: a bitmap of channels in use and the handler of
/// each.
#[derive(Default)]
struct ChannelTable {
    in_use: Vec<u64>,
    handlers: HashMap<u16, Arc<dyn ChannelHandler>>,
}

impl ChannelTable {
    /// Allocate the lowest free channel below `limit`. Channel 0 is never
    /// allocated.
    fn allocate(&mut self, limit: u16, handler: Arc<dyn ChannelHandler>) -> Option<u16> {
        let limit = limit as usize;
        let channel = (0..limit.div_ceil(64)).find_map(|index| {
            let mut word = self.in_use.get(index).copied().unwrap_or(0);
            if index == 0 {
                word |= 1;
            }
            (word != u64::MAX).then(|| index * 64 + (!word).trailing_zeros() as usize)
        })?;
        if channel >= limit {
            return None;
        }
        let (index, bit) = (channel / 64, channel % 64);
        if self.in_use.len() <= index {
            self.in_use.resize(index + 1, 0);
        }
        self.in_use[index] |= 1 << bit;
        self.handlers.insert(channel as u16, handler);
        Some(channel as u16)
    }

    fn release(&mut self, channel: u16) -> bool {
        let (index, bit) = (channel as usize / 64, channel as usize % 64);
        self.handlers.remove(&channel);
        match self.in_use.get_mut(index) {
            Some(word) if *word & (1 << bit) != 0 => {
                *word &= !(1 << bit);
                true
            }
            _ => false,
        }
    }

    fn handler(&self, channel: u16) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(&channel).cloned()
    }

    fn in_use(&self) -> usize {
        self.handlers.len()
    }

    fn clear(&mut self) -> Vec<Arc<dyn ChannelHandler>> {
        self.in_use.clear();
        let mut handlers: Vec<Arc<dyn ChannelHandler>> = Vec::new();
        for (_, handler) in self.handlers.drain() {
            if !handlers
                .iter()
                .any(|seen| Arc::as_ptr(seen) as *const () == Arc::as_ptr(&handler) as *const ())
            {
                handlers.push(handler);
            }
        }
        handlers
    }
}

/// Options for a new connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Local limits and identity.
    pub config: Config,
    /// Hostname sent in Open.
    pub hostname: Option<String>,
    /// Encodes and decodes frame bodies.
    pub codec: Arc<dyn Codec>,
    /// Receives frames for channels nobody allocated.
    pub session_handler: Option<Arc<dyn ChannelHandler>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            config: crate::config::global::get(),
            hostname: None,
            codec: Arc::new(BincodeCodec),
            session_handler: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("config", &self.config)
            .field("hostname", &self.hostname)
            .field("codec", &self.codec)
            .field("session_handler", &self.session_handler.is_some())
            .finish()
    }
}

struct Negotiated {
    properties: ConnectionProperties,
    peer: Option<Open>,
}

pub(crate) struct ConnectionProtocol {
    log_id: String,
    role: ConnectionRole,
    remote: String,
    port: OnceLock<u16>,
    config: Config,
    hostname: Option<String>,
    codec: Arc<dyn Codec>,
    sender: OutboundSender,
    negotiated: Mutex<Negotiated>,
    liveness: Liveness,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
    registry: ConnectionRegistry,
    channels: Mutex<ChannelTable>,
    session_handler: Option<Arc<dyn ChannelHandler>>,
    deferred_close: Mutex<Option<ErrorCondition>>,
    error: Mutex<Option<ErrorCondition>>,
    this: Weak<ConnectionInner>,
}

impl ConnectionProtocol {
    fn key(&self) -> ConnectionKey {
        ConnectionKey::with_port(&self.remote, self.port.get().copied().unwrap_or(0))
    }

    fn connection(&self) -> Option<Connection> {
        self.this.upgrade().map(|inner| Connection { inner })
    }

    fn properties(&self) -> ConnectionProperties {
        self.negotiated.lock().unwrap().properties
    }

    fn local_open(&self) -> Open {
        let idle_time_out = match self.config.heartbeat_interval.as_millis() {
            0 => None,
            millis => Some(u32::try_from(millis).unwrap_or(u32::MAX)),
        };
        Open {
            container_id: self.config.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: self.config.max_frame_size.max(MIN_MAX_FRAME_SIZE),
            channel_max: self.config.channel_max,
            idle_time_out,
        }
    }

    fn send_frame(&self, channel: u16, performative: &Performative) -> Result<(), SendError> {
        // Frames of one channel share a queue so their relative order holds.
        let priority = match channel {
            0 => Priority::Control,
            _ => Priority::Data,
        };
        let body = self.codec.encode(performative)?;
        let max_frame_size = self.properties().max_frame_size as usize;
        let frame = Frame::new(channel, body).encode(max_frame_size)?;
        tracing::trace!(
            log_id = self.log_id,
            channel,
            performative = performative.name(),
            "sending frame"
        );
        self.sender.send(frame, priority)
    }

    /// The largest transfer payload that fits one frame at the negotiated
    /// frame size, given the encoding overhead of a transfer carrying a
    /// delivery tag of `tag_len` bytes.
    fn max_transfer_payload(&self, tag_len: usize) -> Option<usize> {
        let empty = Performative::Transfer(Transfer {
            handle: u32::MAX,
            delivery_id: u32::MAX,
            delivery_tag: Bytes::from(vec![0u8; tag_len]),
            more: true,
            payload: Bytes::new(),
        });
        let overhead = self.codec.encode(&empty).ok()?.len();
        let max_frame_size = self.properties().max_frame_size as usize;
        max_frame_size.checked_sub(FRAME_HEADER_LEN + overhead)
    }

    fn record_error(&self, error: ErrorCondition) {
        self.error.lock().unwrap().get_or_insert(error);
    }

    fn negotiate(&self, open: Open) {
        let mut negotiated = self.negotiated.lock().unwrap();
        negotiated.properties.negotiate(&open);
        tracing::debug!(
            log_id = self.log_id,
            peer_container = open.container_id,
            max_channels = negotiated.properties.max_channels,
            max_frame_size = negotiated.properties.max_frame_size,
            heartbeat = %humantime::format_duration(negotiated.properties.heartbeat_interval),
            "negotiated connection properties"
        );
        negotiated.peer = Some(open);
    }

    fn established(&self) {
        let properties = self.properties();
        tracing::info!(
            log_id = self.log_id,
            key = %self.key(),
            role = ?self.role,
            "connection opened"
        );
        if !properties.heartbeat_interval.is_zero() {
            let monitor = HeartbeatMonitor::start(
                self.this.clone(),
                properties.heartbeat_interval,
                self.liveness.clone(),
                &get_runtime(),
            );
            *self.heartbeat.lock().unwrap() = Some(monitor);
        }
        if let Some(connection) = self.connection() {
            self.registry.register(&connection);
        }
    }

    fn teardown(&self, teardown: Teardown) {
        if let Some(monitor) = self.heartbeat.lock().unwrap().take() {
            monitor.cancel();
        }
        match &teardown {
            Teardown::Graceful => {
                tracing::info!(log_id = self.log_id, "connection closed");
            }
            Teardown::Reject(reason) => {
                tracing::warn!(log_id = self.log_id, reason, "rejecting peer");
                self.record_error(ErrorCondition::new(condition::FRAMING_ERROR, reason));
            }
            Teardown::Abort(reason) => {
                tracing::warn!(log_id = self.log_id, reason, "connection aborted");
                self.record_error(ErrorCondition::new(condition::CONNECTION_FORCED, reason));
            }
        }
        if let Some(connection) = self.connection() {
            self.registry.deregister(&connection);
        }

        let mut handlers = self.channels.lock().unwrap().clear();
        handlers.extend(self.session_handler.clone());
        let error = self.error.lock().unwrap().clone();
        for handler in handlers {
            handler.connection_closed(error.as_ref());
        }

        match teardown {
            Teardown::Abort(_) => self.sender.force_close(),
            Teardown::Graceful | Teardown::Reject(_) => self.sender.close(),
        }
    }
}

impl Protocol for ConnectionProtocol {
    type State = ConnectionState;
    type Event = ConnectionEvent;
    type Action = ConnectionAction;

    fn log_id(&self) -> &str {
        &self.log_id
    }

    fn transition(
        &self,
        state: ConnectionState,
        event: ConnectionEvent,
    ) -> Result<ConnectionTransition, ConnectionEvent> {
        state::transition(self.role, state, event)
    }

    fn perform(&self, action: ConnectionAction) -> Option<ConnectionEvent> {
        match action {
            ConnectionAction::WriteHeader => self
                .sender
                .send(Bytes::copy_from_slice(&compose_header()), Priority::Control)
                .err()
                .map(|err| ConnectionEvent::Abort(format!("write header: {}", err))),
            ConnectionAction::WriteOpen => self
                .send_frame(0, &Performative::Open(self.local_open()))
                .err()
                .map(|err| ConnectionEvent::Abort(format!("write open: {}", err))),
            ConnectionAction::WriteClose(error) => {
                let error = error.or_else(|| self.deferred_close.lock().unwrap().take());
                if let Some(error) = &error {
                    self.record_error(error.clone());
                }
                if let Err(err) = self.send_frame(0, &Performative::Close(Close { error })) {
                    tracing::debug!(log_id = self.log_id, error = %err, "close not sent");
                }
                None
            }
            ConnectionAction::DeferClose(error) => {
                *self.deferred_close.lock().unwrap() = error;
                None
            }
            ConnectionAction::Negotiate(open) => {
                self.negotiate(open);
                None
            }
            ConnectionAction::Established => {
                self.established();
                None
            }
            ConnectionAction::PeerClosed(error) => {
                tracing::info!(
                    log_id = self.log_id,
                    error = error.as_ref().map(tracing::field::display),
                    "peer closed connection"
                );
                if let Some(error) = &error {
                    self.record_error(error.clone());
                }
                self.registry
                    .notify_closed_by_peer(&self.key(), error.as_ref());
                None
            }
            ConnectionAction::Teardown(teardown) => {
                self.teardown(teardown);
                None
            }
        }
    }
}

pub(crate) struct ConnectionInner {
    actor: SerialActor<ConnectionProtocol>,
}

impl ConnectionInner {
    fn protocol(&self) -> &ConnectionProtocol {
        self.actor.protocol()
    }
}

impl HeartbeatTarget for ConnectionInner {
    fn send_heartbeat(&self) {
        if let Err(err) = self
            .protocol()
            .sender
            .send(heartbeat_frame(), Priority::Control)
        {
            tracing::debug!(log_id = self.protocol().log_id, error = %err, "heartbeat not sent");
        }
    }

    fn heartbeat_expired(&self, silence: Duration) {
        self.actor.post(ConnectionEvent::Abort(format!(
            "no inbound traffic for {}",
            humantime::format_duration(silence)
        )));
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// A connection over one transport. Cloning yields another handle to the
/// same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("log_id", &self.protocol().log_id)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection writing to `writer`. Inbound data must be fed
    /// through [`Connection::header_received`] and
    /// [`Connection::frame_received`], usually by
    /// [`crate::transport::spawn_reader`].
    pub fn new(
        remote: impl Into<String>,
        role: ConnectionRole,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        registry: ConnectionRegistry,
        options: ConnectionOptions,
    ) -> Self {
        let remote = remote.into();
        let log_id = format!(
            "conn-{}:{}",
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote
        );
        let inner = Arc::new_cyclic(|this: &Weak<ConnectionInner>| {
            let sender = {
                let this = this.clone();
                OutboundSender::with_failure_hook(log_id.clone(), writer, move |err| {
                    if let Some(inner) = this.upgrade() {
                        inner
                            .actor
                            .post(ConnectionEvent::Abort(format!("write failed: {}", err)));
                    }
                })
            };
            let properties = ConnectionProperties::from_config(&options.config);
            let protocol = ConnectionProtocol {
                log_id,
                role,
                remote,
                port: OnceLock::new(),
                config: options.config,
                hostname: options.hostname,
                codec: options.codec,
                sender,
                negotiated: Mutex::new(Negotiated {
                    properties,
                    peer: None,
                }),
                liveness: Liveness::default(),
                heartbeat: Mutex::new(None),
                registry,
                channels: Mutex::new(ChannelTable::default()),
                session_handler: options.session_handler,
                deferred_close: Mutex::new(None),
                error: Mutex::new(None),
                this: this.clone(),
            };
            ConnectionInner {
                actor: SerialActor::new(protocol, ConnectionState::Start),
            }
        });
        Self { inner }
    }

    fn protocol(&self) -> &ConnectionProtocol {
        self.inner.protocol()
    }

    pub(crate) fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identity in the registry.
    pub fn key(&self) -> ConnectionKey {
        self.protocol().key()
    }

    /// Record the transport's port. Only the first call has an effect,
    /// and it must happen before the Open exchange completes.
    pub fn set_port(&self, port: u16) {
        if self.protocol().port.set(port).is_err() {
            tracing::warn!(log_id = self.protocol().log_id, port, "port already set");
        }
    }

    /// Which side initiated the transport.
    pub fn role(&self) -> ConnectionRole {
        self.protocol().role
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.actor.state()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.actor.subscribe()
    }

    /// Limits in effect.
    pub fn properties(&self) -> ConnectionProperties {
        self.protocol().properties()
    }

    /// The peer's Open, once received.
    pub fn peer_open(&self) -> Option<Open> {
        self.protocol().negotiated.lock().unwrap().peer.clone()
    }

    /// Why the connection ended, if it did not end normally.
    pub fn error(&self) -> Option<ErrorCondition> {
        self.protocol().error.lock().unwrap().clone()
    }

    /// The connection's outbound sender.
    pub fn sender(&self) -> &OutboundSender {
        &self.protocol().sender
    }

    /// Send our protocol header.
    pub fn send_header(&self) {
        self.inner.actor.post(ConnectionEvent::SendHeader);
    }

    /// Send our Open. May be called before the header exchange completes.
    pub fn send_open(&self) {
        self.inner.actor.post(ConnectionEvent::SendOpen);
    }

    /// Close the connection, optionally with an error.
    pub fn close(&self, error: Option<ErrorCondition>) {
        self.inner.actor.post(ConnectionEvent::SendClose(error));
    }

    /// The peer's protocol header arrived.
    pub fn header_received(&self, header: [u8; 8]) {
        self.protocol().liveness.touch();
        self.inner.actor.post(ConnectionEvent::HeaderReceived(header));
    }

    /// A frame arrived.
    pub fn frame_received(&self, frame: Frame) {
        let protocol = self.protocol();
        protocol.liveness.touch();

        let Frame { channel, body } = frame;
        let Some(body) = body.filter(|body| !body.is_empty()) else {
            tracing::trace!(log_id = protocol.log_id, "heartbeat received");
            return;
        };
        let performative = match protocol.codec.decode(body) {
            Ok(performative) => performative,
            Err(err) => {
                self.framing_error(format!("undecodable frame on channel {}: {}", channel, err));
                return;
            }
        };
        tracing::trace!(
            log_id = protocol.log_id,
            channel,
            performative = performative.name(),
            "received frame"
        );

        if channel == 0 {
            match performative {
                Performative::Open(open) => {
                    self.inner.actor.post(ConnectionEvent::OpenReceived(open))
                }
                Performative::Close(close) => {
                    self.inner.actor.post(ConnectionEvent::CloseReceived(close))
                }
                other => self.framing_error(format!("{} on channel 0", other.name())),
            }
            return;
        }

        let state = self.state();
        if !state.carries_sessions() {
            tracing::warn!(
                log_id = protocol.log_id,
                channel,
                state = ?state,
                "dropping frame for channel while not open"
            );
            return;
        }
        let handler = protocol
            .channels
            .lock()
            .unwrap()
            .handler(channel)
            .or_else(|| protocol.session_handler.clone());
        match handler {
            Some(handler) => handler.frame_received(channel, performative),
            None => tracing::debug!(
                log_id = protocol.log_id,
                channel,
                "no handler for channel; dropping frame"
            ),
        }
    }

    fn framing_error(&self, reason: String) {
        tracing::warn!(log_id = self.protocol().log_id, reason, "framing error");
        self.close(Some(ErrorCondition::new(condition::FRAMING_ERROR, reason)));
    }

    /// The transport closed or failed underneath the connection.
    pub fn transport_closed(&self, reason: impl Into<String>) {
        if self.state().is_terminal() {
            return;
        }
        self.inner.actor.post(ConnectionEvent::Abort(reason.into()));
    }

    /// Wait for the Open exchange. Fails with [`WaitError::Terminated`] if
    /// the connection starts closing first.
    pub async fn wait_for_open_exchange(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let state = self
            .inner
            .actor
            .wait_for(
                |state| {
                    matches!(
                        state,
                        ConnectionState::Opened
                            | ConnectionState::ClosePipe
                            | ConnectionState::CloseSent
                            | ConnectionState::CloseRcvd
                            | ConnectionState::End
                    )
                },
                timeout,
            )
            .await?;
        match state {
            ConnectionState::Opened => Ok(()),
            _ => Err(WaitError::Terminated),
        }
    }

    /// Wait for the connection to end.
    pub async fn wait_for_end(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        self.inner
            .actor
            .wait_for(ConnectionState::is_terminal, timeout)
            .await
            .map(|_| ())
    }

    /// Allocate the lowest free channel for `handler`. Requires the peer's
    /// Open, since the channel limit is negotiated.
    pub fn allocate_channel(
        &self,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<ChannelSender, ConnectionError> {
        let protocol = self.protocol();
        let state = self.state();
        let negotiated = protocol.negotiated.lock().unwrap().peer.is_some();
        if !negotiated
            || !matches!(
                state,
                ConnectionState::OpenSent | ConnectionState::OpenRcvd | ConnectionState::Opened
            )
        {
            return Err(ConnectionError::NotOpen(state));
        }
        let max_channels = protocol.properties().max_channels;
        let channel = protocol
            .channels
            .lock()
            .unwrap()
            .allocate(max_channels, handler)
            .ok_or(ConnectionError::ChannelsExhausted(max_channels))?;
        tracing::debug!(log_id = protocol.log_id, channel, "allocated channel");
        Ok(ChannelSender {
            connection: Arc::downgrade(&self.inner),
            channel,
        })
    }

    /// Return `channel` to the pool.
    pub fn release_channel(&self, channel: u16) {
        let protocol = self.protocol();
        if protocol.channels.lock().unwrap().release(channel) {
            tracing::debug!(log_id = protocol.log_id, channel, "released channel");
        }
    }

    /// Number of allocated channels.
    pub fn channels_in_use(&self) -> usize {
        self.protocol().channels.lock().unwrap().in_use()
    }

    /// Send `performative` on `channel`.
    pub fn send_frame(&self, channel: u16, performative: &Performative) -> Result<(), SendError> {
        self.protocol().send_frame(channel, performative)
    }
}
