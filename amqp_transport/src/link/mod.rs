/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Links.
//!
//! A [`Link`] runs the Attach and Detach exchanges for one unidirectional
//! message path and, once attached, owns a flow endpoint for its role: a
//! sender endpoint that transfers queued messages as credit allows, or a
//! receiver endpoint that grants credit according to its
//! [`CreditPolicy`] and delivers reassembled messages.
//!
//! Lifecycle events are serialized through a [`SerialActor`]; Flow and
//! Transfer frames go straight to the endpoint, which has its own lock.
//! Frames leave through a [`FrameSink`], normally a session's channel.

mod nudger;
mod receiver;
mod sender;
mod state;

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use enum_as_inner::EnumAsInner;
pub use nudger::CreditNudger;
use nudger::CreditRequester;
pub use receiver::CreditPolicy;
pub use receiver::Delivery;
use receiver::ReceiverEndpoint;
pub(crate) use sender::DELIVERY_TAG_LEN;
use sender::SenderEndpoint;
use state::LinkAction;
use state::LinkEvent;
pub use state::LinkState;
use state::LinkTransition;
use tokio::sync::mpsc;

use crate::actor::Protocol;
use crate::actor::SerialActor;
use crate::actor::WaitError;
use crate::config::Config;
use crate::connection::FrameSink;
use crate::performative::Attach;
use crate::performative::Detach;
use crate::performative::ErrorCondition;
use crate::performative::Flow;
use crate::performative::Performative;
use crate::performative::Role;
use crate::performative::Transfer;
use crate::performative::condition;

/// Errors from link operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link has no flow endpoint.
    #[error("link {0} is not attached")]
    NotAttached(String),
    /// The operation belongs to the other role.
    #[error("link {name} is a {role:?}")]
    WrongRole { name: String, role: Role },
    /// The sender already holds as many messages as it may queue.
    #[error("{limit} messages already queued")]
    AvailableLimitReached { limit: u32 },
    /// The message exceeds the peer's maximum message size.
    #[error("message of {size} bytes exceeds the peer's limit of {max}")]
    MessageTooLarge { size: u64, max: u64 },
    /// Waiting for a state failed.
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Correlates a locally initiated link with the peer's Attach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    /// Source address.
    pub source: Option<String>,
    /// Target address.
    pub target: Option<String>,
}

impl LinkKey {
    /// The key an Attach refers to.
    pub fn of(attach: &Attach) -> Self {
        Self {
            source: attach.source.clone(),
            target: attach.target.clone(),
        }
    }
}

/// Options for a new link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Link name.
    pub name: String,
    /// Our handle for the link.
    pub handle: u32,
    /// Our role.
    pub role: Role,
    /// Source address.
    pub source: Option<String>,
    /// Target address.
    pub target: Option<String>,
    /// First delivery count of a sender.
    pub initial_delivery_count: u32,
    /// Largest message we accept, advertised in Attach.
    pub max_message_size: Option<u64>,
    /// Split outgoing messages into transfers of at most this many bytes.
    pub max_fragment_size: Option<usize>,
    /// How a receiver grants credit.
    pub credit_policy: CreditPolicy,
    /// Limits and thresholds.
    pub config: Config,
}

impl LinkOptions {
    fn new(name: impl Into<String>, handle: u32, role: Role) -> Self {
        let config = crate::config::global::get();
        Self {
            name: name.into(),
            handle,
            role,
            source: None,
            target: None,
            initial_delivery_count: 0,
            max_message_size: None,
            max_fragment_size: None,
            credit_policy: CreditPolicy::auto(&config),
            config,
        }
    }

    /// Options for a sending link.
    pub fn sender(name: impl Into<String>, handle: u32) -> Self {
        Self::new(name, handle, Role::Sender)
    }

    /// Options for a receiving link.
    pub fn receiver(name: impl Into<String>, handle: u32) -> Self {
        Self::new(name, handle, Role::Receiver)
    }

    /// Set the source address.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the target address.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the receiver's credit policy.
    pub fn credit_policy(mut self, policy: CreditPolicy) -> Self {
        self.credit_policy = policy;
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.credit_policy = match self.credit_policy {
            CreditPolicy::Auto { .. } => CreditPolicy::auto(&config),
            policy => policy,
        };
        self.config = config;
        self
    }

    fn key(&self) -> LinkKey {
        LinkKey {
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }
}

#[derive(Clone, EnumAsInner)]
enum Endpoint {
    Sender(Arc<SenderEndpoint>),
    Receiver(Arc<ReceiverEndpoint>),
}

// The endpoint, and a Flow that arrived before it existed. The peer may
// start granting credit as soon as it has sent its Attach, which can be
// before we have processed that Attach.
#[derive(Default)]
struct FlowSlot {
    endpoint: Option<Endpoint>,
    early_flow: Option<Flow>,
}

pub(crate) struct LinkProtocol {
    id: u64,
    log_id: String,
    options: LinkOptions,
    sink: Arc<dyn FrameSink>,
    nudger: Option<CreditNudger>,
    peer: Mutex<Option<Attach>>,
    slot: Mutex<FlowSlot>,
    deliveries_tx: mpsc::UnboundedSender<Delivery>,
    deliveries_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    error: Mutex<Option<ErrorCondition>>,
    this: Weak<LinkInner>,
}

impl LinkProtocol {
    fn local_attach(&self) -> Attach {
        Attach {
            name: self.options.name.clone(),
            handle: self.options.handle,
            role: self.options.role,
            source: self.options.source.clone(),
            target: self.options.target.clone(),
            initial_delivery_count: match self.options.role {
                Role::Sender => Some(self.options.initial_delivery_count),
                Role::Receiver => None,
            },
            max_message_size: self.options.max_message_size,
        }
    }

    fn record_error(&self, error: ErrorCondition) {
        self.error.lock().unwrap().get_or_insert(error);
    }

    fn send(&self, performative: Performative) {
        let name = performative.name();
        if let Err(err) = self.sink.send(performative) {
            tracing::warn!(log_id = self.log_id, performative = name, error = %err, "send failed");
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.slot.lock().unwrap().endpoint.clone()
    }

    fn established(&self) {
        let peer = self.peer.lock().unwrap().clone();
        let max_message_size = peer.as_ref().and_then(|peer| peer.max_message_size);
        let endpoint = match self.options.role {
            Role::Sender => Endpoint::Sender(Arc::new(SenderEndpoint::new(
                self.options.handle,
                self.log_id.clone(),
                Arc::clone(&self.sink),
                self.options.initial_delivery_count,
                &self.options.config,
                max_message_size,
                self.options.max_fragment_size,
            ))),
            Role::Receiver => Endpoint::Receiver(Arc::new(ReceiverEndpoint::new(
                self.options.handle,
                self.log_id.clone(),
                Arc::clone(&self.sink),
                peer.and_then(|peer| peer.initial_delivery_count)
                    .unwrap_or(0),
                self.options.credit_policy,
                &self.options.config,
                self.options.max_message_size,
                self.deliveries_tx.clone(),
            ))),
        };
        let early_flow = {
            let mut slot = self.slot.lock().unwrap();
            slot.endpoint = Some(endpoint.clone());
            slot.early_flow.take()
        };
        tracing::info!(
            log_id = self.log_id,
            role = ?self.options.role,
            source = self.options.source,
            target = self.options.target,
            "link attached"
        );
        if let Endpoint::Receiver(receiver) = &endpoint {
            receiver.start();
        }
        if let Some(flow) = early_flow {
            self.apply_flow(endpoint, &flow);
        }
    }

    fn destroy(&self) {
        let endpoint = {
            let mut slot = self.slot.lock().unwrap();
            slot.early_flow = None;
            slot.endpoint.take()
        };
        if let Some(nudger) = &self.nudger {
            nudger.clear(self.id);
        }
        if endpoint.is_some() {
            tracing::info!(log_id = self.log_id, "link detached");
        }
    }

    fn apply_flow(&self, endpoint: Endpoint, flow: &Flow) {
        match endpoint {
            Endpoint::Sender(sender) => match sender.flow_received(flow) {
                Ok(blocked) => self.update_nudger(blocked),
                Err(error) => self.violation(error),
            },
            Endpoint::Receiver(receiver) => receiver.flow_received(flow),
        }
    }

    fn update_nudger(&self, blocked: bool) {
        let Some(nudger) = &self.nudger else {
            return;
        };
        if blocked {
            let requester: Weak<dyn CreditRequester> = self.this.clone();
            nudger.blocked(self.id, requester);
        } else {
            nudger.clear(self.id);
        }
    }

    fn violation(&self, error: ErrorCondition) {
        tracing::warn!(log_id = self.log_id, error = %error, "flow control violation; detaching");
        if let Some(inner) = self.this.upgrade() {
            inner.actor.post(LinkEvent::SendDetach(Some(error)));
        }
    }
}

impl Protocol for LinkProtocol {
    type State = LinkState;
    type Event = LinkEvent;
    type Action = LinkAction;

    fn log_id(&self) -> &str {
        &self.log_id
    }

    fn transition(&self, state: LinkState, event: LinkEvent) -> Result<LinkTransition, LinkEvent> {
        state::transition(self.options.role, state, event)
    }

    fn perform(&self, action: LinkAction) -> Option<LinkEvent> {
        match action {
            LinkAction::WriteAttach => self.send(Performative::Attach(self.local_attach())),
            LinkAction::RecordPeer(attach) => {
                tracing::debug!(
                    log_id = self.log_id,
                    peer_handle = attach.handle,
                    peer_role = ?attach.role,
                    "peer attached"
                );
                *self.peer.lock().unwrap() = Some(attach);
            }
            LinkAction::Established => self.established(),
            LinkAction::WriteDetach(error) => {
                if let Some(error) = &error {
                    self.record_error(error.clone());
                }
                self.send(Performative::Detach(Detach {
                    handle: self.options.handle,
                    closed: true,
                    error,
                }));
            }
            LinkAction::PeerDetached(error) => {
                tracing::debug!(
                    log_id = self.log_id,
                    error = error.as_ref().map(tracing::field::display),
                    "peer detached"
                );
                if let Some(error) = error {
                    self.record_error(error);
                }
            }
            LinkAction::Destroy => self.destroy(),
        }
        None
    }
}

pub(crate) struct LinkInner {
    actor: SerialActor<LinkProtocol>,
}

impl CreditRequester for LinkInner {
    fn request_credit(&self) -> bool {
        match self.actor.protocol().endpoint() {
            Some(Endpoint::Sender(sender)) => sender.request_credit(),
            _ => false,
        }
    }
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(0);

/// A link. Cloning yields another handle to the same link.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("log_id", &self.protocol().log_id)
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

impl Link {
    /// Create a detached link sending frames through `sink`. Blocked
    /// senders are nudged by `nudger`, if given.
    pub fn new(
        options: LinkOptions,
        sink: Arc<dyn FrameSink>,
        nudger: Option<CreditNudger>,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let log_id = format!("link[{}/{}]", options.name, options.handle);
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|this: &Weak<LinkInner>| LinkInner {
            actor: SerialActor::new(
                LinkProtocol {
                    id,
                    log_id,
                    options,
                    sink,
                    nudger,
                    peer: Mutex::new(None),
                    slot: Mutex::new(FlowSlot::default()),
                    deliveries_tx,
                    deliveries_rx: Mutex::new(Some(deliveries_rx)),
                    error: Mutex::new(None),
                    this: this.clone(),
                },
                LinkState::Detached,
            ),
        });
        Self { inner }
    }

    fn protocol(&self) -> &LinkProtocol {
        self.inner.actor.protocol()
    }

    /// The link name.
    pub fn name(&self) -> &str {
        &self.protocol().options.name
    }

    /// Our handle.
    pub fn handle(&self) -> u32 {
        self.protocol().options.handle
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.protocol().options.role
    }

    /// Source and target, for correlating the peer's Attach.
    pub fn key(&self) -> LinkKey {
        self.protocol().options.key()
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.inner.actor.state()
    }

    /// The peer's Attach, once received.
    pub fn peer(&self) -> Option<Attach> {
        self.protocol().peer.lock().unwrap().clone()
    }

    /// Why the link detached, if not normally.
    pub fn error(&self) -> Option<ErrorCondition> {
        self.protocol().error.lock().unwrap().clone()
    }

    /// Send our Attach.
    pub fn attach(&self) {
        self.inner.actor.post(LinkEvent::SendAttach);
    }

    /// Detach, optionally with an error.
    pub fn detach(&self, error: Option<ErrorCondition>) {
        self.inner.actor.post(LinkEvent::SendDetach(error));
    }

    /// The peer's Attach arrived.
    pub fn attach_received(&self, attach: Attach) {
        self.inner.actor.post(LinkEvent::AttachReceived(attach));
    }

    /// The peer's Detach arrived.
    pub fn detach_received(&self, detach: Detach) {
        self.inner.actor.post(LinkEvent::DetachReceived(detach));
    }

    /// The peer's Flow arrived.
    pub fn flow_received(&self, flow: Flow) {
        let protocol = self.protocol();
        let endpoint = {
            let mut slot = protocol.slot.lock().unwrap();
            match &slot.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => {
                    tracing::debug!(log_id = protocol.log_id, "flow before attach; holding it");
                    slot.early_flow = Some(flow);
                    return;
                }
            }
        };
        protocol.apply_flow(endpoint, &flow);
    }

    /// A Transfer arrived.
    pub fn transfer_received(&self, transfer: Transfer) {
        let protocol = self.protocol();
        match protocol.endpoint() {
            Some(Endpoint::Receiver(receiver)) => {
                if let Err(error) = receiver.transfer_received(transfer) {
                    protocol.violation(error);
                }
            }
            Some(Endpoint::Sender(_)) => {
                protocol.violation(ErrorCondition::new(
                    condition::NOT_ALLOWED,
                    "transfer received on a sending link",
                ));
            }
            None => tracing::warn!(
                log_id = protocol.log_id,
                state = ?self.state(),
                "transfer on unattached link; dropping"
            ),
        }
    }

    /// Drop the link's endpoint and return to DETACHED without any
    /// exchange, e.g. because the session or connection ended.
    pub fn force_detach(&self, error: Option<ErrorCondition>) {
        let protocol = self.protocol();
        if let Some(error) = error {
            protocol.record_error(error);
        }
        let discarded = self.inner.actor.reset(LinkState::Detached);
        tracing::debug!(log_id = protocol.log_id, discarded, "forced detach");
        protocol.destroy();
    }

    /// Wait until attached. Fails with [`WaitError::Terminated`] if the
    /// link detaches instead.
    pub async fn wait_for_attached(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        let mut left_detached = false;
        let state = self
            .inner
            .actor
            .wait_for(
                |state| {
                    left_detached |= state != LinkState::Detached;
                    match state {
                        LinkState::Attached
                        | LinkState::DetachSent
                        | LinkState::DetachRcvd
                        | LinkState::DetachPipe => true,
                        LinkState::Detached => left_detached || self.error().is_some(),
                        LinkState::AttachSent | LinkState::AttachRcvd => false,
                    }
                },
                timeout,
            )
            .await?;
        match state {
            LinkState::Attached => Ok(()),
            _ => Err(WaitError::Terminated),
        }
    }

    /// Wait until detached.
    pub async fn wait_for_detached(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        self.inner
            .actor
            .wait_for(|state| state == LinkState::Detached, timeout)
            .await
            .map(|_| ())
    }

    fn sender(&self) -> Result<Arc<SenderEndpoint>, LinkError> {
        match self.protocol().endpoint() {
            Some(Endpoint::Sender(sender)) => Ok(sender),
            Some(Endpoint::Receiver(_)) => Err(self.wrong_role()),
            None => Err(LinkError::NotAttached(self.name().to_string())),
        }
    }

    fn receiver(&self) -> Result<Arc<ReceiverEndpoint>, LinkError> {
        match self.protocol().endpoint() {
            Some(Endpoint::Receiver(receiver)) => Ok(receiver),
            Some(Endpoint::Sender(_)) => Err(self.wrong_role()),
            None => Err(LinkError::NotAttached(self.name().to_string())),
        }
    }

    fn wrong_role(&self) -> LinkError {
        LinkError::WrongRole {
            name: self.name().to_string(),
            role: self.role(),
        }
    }

    /// Queue a message on a sending link. It is transferred as soon as
    /// the receiver grants credit.
    pub fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        let blocked = self.sender()?.send(payload)?;
        self.protocol().update_nudger(blocked);
        Ok(())
    }

    /// Grant `credit` more on a receiving link.
    pub fn issue_credit(&self, credit: u32) -> Result<(), LinkError> {
        self.receiver()?.issue_credit(credit);
        Ok(())
    }

    /// Ask the sender to use up or return its credit.
    pub fn drain(&self) -> Result<(), LinkError> {
        self.receiver()?.drain();
        Ok(())
    }

    /// Whether a drain requested on a receiving link is outstanding.
    pub fn draining(&self) -> bool {
        self.receiver().is_ok_and(|receiver| receiver.draining())
    }

    /// Take the stream of messages received on this link. Returns `None`
    /// after the first call.
    pub fn deliveries(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.protocol().deliveries_rx.lock().unwrap().take()
    }

    /// Current credit, once attached.
    pub fn link_credit(&self) -> Option<i64> {
        self.protocol().endpoint().map(|endpoint| match endpoint {
            Endpoint::Sender(sender) => sender.link_credit(),
            Endpoint::Receiver(receiver) => receiver.link_credit(),
        })
    }

    /// Current delivery count, once attached.
    pub fn delivery_count(&self) -> Option<u32> {
        self.protocol().endpoint().map(|endpoint| match endpoint {
            Endpoint::Sender(sender) => sender.delivery_count(),
            Endpoint::Receiver(receiver) => receiver.delivery_count(),
        })
    }

    /// Messages the sender has ready, once attached: our queue on a
    /// sending link, the peer's report on a receiving one.
    pub fn available(&self) -> Option<u32> {
        self.protocol().endpoint().map(|endpoint| match endpoint {
            Endpoint::Sender(sender) => sender.available(),
            Endpoint::Receiver(receiver) => receiver.available(),
        })
    }

    /// Whether this link is the sending side.
    pub fn is_sender(&self) -> bool {
        self.protocol()
            .endpoint()
            .is_some_and(|endpoint| endpoint.is_sender())
    }
}

/// Locally initiated links waiting for the peer's Attach, keyed by source
/// and target.
#[derive(Clone, Default)]
pub struct LinkTracker {
    pending: Arc<DashMap<LinkKey, Link>>,
}

impl fmt::Debug for LinkTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTracker")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl LinkTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `link` until the peer's Attach arrives. Returns a link that
    /// was already tracked under the same key.
    pub fn register(&self, link: &Link) -> Option<Link> {
        self.pending.insert(link.key(), link.clone())
    }

    /// Find and stop tracking the link `attach` answers.
    pub fn correlate(&self, attach: &Attach) -> Option<Link> {
        self.pending
            .remove(&LinkKey::of(attach))
            .map(|(_, link)| link)
    }

    /// Stop tracking `key`.
    pub fn remove(&self, key: &LinkKey) -> Option<Link> {
        self.pending.remove(key).map(|(_, link)| link)
    }

    /// Number of tracked links.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelHandler;
    use crate::connection::Connection;
    use crate::connection::ConnectionOptions;
    use crate::connection::ConnectionRegistry;
    use crate::connection::ConnectionRole;
    use crate::link::sender::tests::RecordingSink;
    use crate::outbound::SendError;
    use crate::transport::spawn_reader;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Delivers frames straight to the peer link.
    #[derive(Default)]
    struct Wire {
        peer: Mutex<Option<Link>>,
        sent: Mutex<Vec<&'static str>>,
    }

    impl FrameSink for Wire {
        fn send(&self, performative: Performative) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(performative.name());
            let Some(peer) = self.peer.lock().unwrap().clone() else {
                return Err(SendError::Closed);
            };
            match performative {
                Performative::Attach(attach) => peer.attach_received(attach),
                Performative::Detach(detach) => peer.detach_received(detach),
                Performative::Flow(flow) => peer.flow_received(flow),
                Performative::Transfer(transfer) => peer.transfer_received(transfer),
                Performative::Open(_) | Performative::Close(_) => (),
            }
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            auto_credit_low_water: 2,
            auto_credit_boost: 4,
            nudge_initial_interval: Duration::from_secs(2),
            nudge_tick: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn pair(policy: CreditPolicy, nudger: Option<CreditNudger>) -> (Link, Link, Arc<Wire>) {
        let to_receiver = Arc::new(Wire::default());
        let to_sender = Arc::new(Wire::default());
        let sender = Link::new(
            LinkOptions::sender("out", 0)
                .source("here")
                .target("there")
                .config(config()),
            to_receiver.clone(),
            nudger,
        );
        let receiver = Link::new(
            LinkOptions::receiver("in", 5)
                .source("here")
                .target("there")
                .config(config())
                .credit_policy(policy),
            to_sender.clone(),
            None,
        );
        *to_receiver.peer.lock().unwrap() = Some(receiver.clone());
        *to_sender.peer.lock().unwrap() = Some(sender.clone());
        (sender, receiver, to_receiver)
    }

    #[tokio::test]
    async fn test_attach_transfer_detach() {
        let (sender, receiver, _) = pair(CreditPolicy::Auto { low_water: 2, boost: 4 }, None);
        let mut deliveries = receiver.deliveries().unwrap();
        assert!(receiver.deliveries().is_none());

        sender.attach();
        futures::try_join!(
            sender.wait_for_attached(Some(TIMEOUT)),
            receiver.wait_for_attached(Some(TIMEOUT)),
        )
        .unwrap();
        assert_eq!(receiver.peer().unwrap().initial_delivery_count, Some(0));
        // The receiver's first grant arrived before the sender had
        // processed the receiver's Attach.
        assert_eq!(sender.link_credit(), Some(4));

        for i in 0..10u8 {
            sender.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(deliveries.recv().await.unwrap().payload, Bytes::from(vec![i]));
        }
        assert_eq!(sender.delivery_count(), Some(10));
        assert_eq!(receiver.delivery_count(), Some(10));

        sender.detach(None);
        futures::try_join!(
            sender.wait_for_detached(Some(TIMEOUT)),
            receiver.wait_for_detached(Some(TIMEOUT)),
        )
        .unwrap();
        assert_eq!(sender.error(), None);
        assert!(matches!(
            sender.send(Bytes::from_static(b"late")),
            Err(LinkError::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_role_operations() {
        let (sender, receiver, _) = pair(CreditPolicy::Explicit, None);
        sender.attach();
        sender.wait_for_attached(Some(TIMEOUT)).await.unwrap();
        assert!(matches!(sender.issue_credit(1), Err(LinkError::WrongRole { .. })));
        assert!(matches!(
            receiver.send(Bytes::new()),
            Err(LinkError::WrongRole { .. })
        ));
        assert!(sender.is_sender());
        assert!(!receiver.is_sender());
    }

    #[tokio::test]
    async fn test_drain_round_trip() {
        let (sender, receiver, _) = pair(CreditPolicy::Explicit, None);
        let mut deliveries = receiver.deliveries().unwrap();
        sender.attach();
        receiver.wait_for_attached(Some(TIMEOUT)).await.unwrap();

        sender.send(Bytes::from_static(b"one")).unwrap();
        receiver.issue_credit(5).unwrap();
        assert_eq!(deliveries.recv().await.unwrap().payload, Bytes::from_static(b"one"));
        receiver.drain().unwrap();
        assert!(!receiver.draining());
        assert_eq!(receiver.link_credit(), Some(0));
        assert_eq!(sender.link_credit(), Some(0));
        assert_eq!(sender.delivery_count(), Some(5));
        assert_eq!(receiver.delivery_count(), Some(5));
    }

    #[tokio::test]
    async fn test_demand_policy() {
        let (sender, receiver, _) = pair(CreditPolicy::Demand, None);
        let mut deliveries = receiver.deliveries().unwrap();
        sender.attach();
        receiver.wait_for_attached(Some(TIMEOUT)).await.unwrap();
        for i in 0..3u8 {
            sender.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(deliveries.recv().await.unwrap().payload, Bytes::from(vec![i]));
        }
        assert_eq!(sender.available(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_sender_is_nudged() {
        let nudger = CreditNudger::start(&config());
        let (sender, receiver, to_receiver) = pair(CreditPolicy::Explicit, Some(nudger.clone()));
        let mut deliveries = receiver.deliveries().unwrap();
        sender.attach();
        receiver.wait_for_attached(Some(TIMEOUT)).await.unwrap();

        sender.send(Bytes::from_static(b"stuck")).unwrap();
        assert_eq!(nudger.tracked(), 1);
        assert_eq!(receiver.available(), Some(1));
        let flows_before = count(&to_receiver, "flow");

        tokio::time::sleep(Duration::from_millis(2050)).await;
        assert_eq!(count(&to_receiver, "flow"), flows_before + 1);

        receiver.issue_credit(1).unwrap();
        assert_eq!(deliveries.recv().await.unwrap().payload, Bytes::from_static(b"stuck"));
        assert_eq!(nudger.tracked(), 0);
    }

    fn count(wire: &Wire, name: &str) -> usize {
        wire.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| **sent == name)
            .count()
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_overrun_detaches_with_error() {
        let sink = Arc::new(RecordingSink::default());
        let receiver = Link::new(
            LinkOptions::receiver("in", 1)
                .config(config())
                .credit_policy(CreditPolicy::Explicit),
            sink.clone(),
            None,
        );
        receiver.attach();
        receiver.attach_received(Attach {
            name: "in".to_string(),
            handle: 9,
            role: Role::Sender,
            source: None,
            target: None,
            initial_delivery_count: Some(100),
            max_message_size: None,
        });
        receiver.wait_for_attached(Some(TIMEOUT)).await.unwrap();
        assert_eq!(receiver.delivery_count(), Some(100));

        for id in 0..11 {
            receiver.transfer_received(Transfer {
                handle: 9,
                delivery_id: id,
                delivery_tag: Bytes::new(),
                more: false,
                payload: Bytes::from_static(b"x"),
            });
        }
        assert_eq!(receiver.state(), LinkState::DetachSent);
        let detach = sink
            .take()
            .into_iter()
            .find_map(|performative| performative.into_detach().ok())
            .unwrap();
        assert_eq!(
            detach.error.unwrap().condition,
            condition::TRANSFER_LIMIT_EXCEEDED
        );
        assert_eq!(
            receiver.error().unwrap().condition,
            condition::TRANSFER_LIMIT_EXCEEDED
        );
        assert!(logs_contain("flow control violation"));

        receiver.detach_received(Detach {
            handle: 9,
            closed: true,
            error: None,
        });
        assert_eq!(receiver.state(), LinkState::Detached);
        assert_eq!(receiver.link_credit(), None);
    }

    #[tokio::test]
    async fn test_force_detach() {
        let (sender, receiver, _) = pair(CreditPolicy::Explicit, None);
        sender.attach();
        sender.wait_for_attached(Some(TIMEOUT)).await.unwrap();
        sender.force_detach(Some(ErrorCondition::new(
            condition::DETACH_FORCED,
            "session ended",
        )));
        assert_eq!(sender.state(), LinkState::Detached);
        assert_eq!(sender.link_credit(), None);
        assert_eq!(sender.error().unwrap().condition, condition::DETACH_FORCED);
        // The peer is unaffected until its own session tells it.
        assert_eq!(receiver.state(), LinkState::Attached);
    }

    #[test]
    fn test_tracker_correlates() {
        let tracker = LinkTracker::new();
        let link = Link::new(
            LinkOptions::sender("out", 0).source("a").target("b"),
            Arc::new(RecordingSink::default()),
            None,
        );
        assert!(tracker.register(&link).is_none());
        let mut answer = Attach {
            name: "out".to_string(),
            handle: 3,
            role: Role::Receiver,
            source: Some("a".to_string()),
            target: Some("c".to_string()),
            initial_delivery_count: None,
            max_message_size: None,
        };
        assert!(tracker.correlate(&answer).is_none());
        answer.target = Some("b".to_string());
        assert_eq!(tracker.correlate(&answer).unwrap().name(), "out");
        assert!(tracker.is_empty());
    }

    /// Hands a channel's frames to the link bound to it.
    #[derive(Default)]
    struct Router {
        link: Mutex<Option<Link>>,
    }

    impl ChannelHandler for Router {
        fn frame_received(&self, _channel: u16, performative: Performative) {
            let Some(link) = self.link.lock().unwrap().clone() else {
                return;
            };
            match performative {
                Performative::Attach(attach) => link.attach_received(attach),
                Performative::Detach(detach) => link.detach_received(detach),
                Performative::Flow(flow) => link.flow_received(flow),
                Performative::Transfer(transfer) => link.transfer_received(transfer),
                Performative::Open(_) | Performative::Close(_) => (),
            }
        }
    }

    /// An attached sender and receiver on two connections joined by an
    /// in-memory transport holding at most `capacity` unread bytes.
    async fn connected_pair(
        config: Config,
        policy: CreditPolicy,
        capacity: usize,
    ) -> (Link, Link, [Connection; 2]) {
        let registry = ConnectionRegistry::new();
        let options = || ConnectionOptions {
            config: config.clone(),
            ..ConnectionOptions::default()
        };
        let (a, b) = tokio::io::duplex(capacity);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let client = Connection::new(
            "server",
            ConnectionRole::Active,
            a_write,
            registry.clone(),
            options(),
        );
        let server = Connection::new(
            "client",
            ConnectionRole::Passive,
            b_write,
            registry.clone(),
            options(),
        );
        spawn_reader(client.clone(), a_read);
        spawn_reader(server.clone(), b_read);
        client.send_header();
        client.send_open();
        client.wait_for_open_exchange(Some(TIMEOUT)).await.unwrap();
        server.wait_for_open_exchange(Some(TIMEOUT)).await.unwrap();

        let client_router = Arc::new(Router::default());
        let server_router = Arc::new(Router::default());
        let sender = Link::new(
            LinkOptions::sender("out", 0)
                .source("here")
                .target("there")
                .config(config.clone()),
            Arc::new(client.allocate_channel(client_router.clone()).unwrap()),
            None,
        );
        let receiver = Link::new(
            LinkOptions::receiver("in", 0)
                .source("here")
                .target("there")
                .config(config.clone())
                .credit_policy(policy),
            Arc::new(server.allocate_channel(server_router.clone()).unwrap()),
            None,
        );
        *client_router.link.lock().unwrap() = Some(sender.clone());
        *server_router.link.lock().unwrap() = Some(receiver.clone());

        sender.attach();
        futures::try_join!(
            sender.wait_for_attached(Some(TIMEOUT)),
            receiver.wait_for_attached(Some(TIMEOUT)),
        )
        .unwrap();
        (sender, receiver, [client, server])
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_beyond_credit_over_connection() {
        let (sender, receiver, _connections) =
            connected_pair(config(), CreditPolicy::Explicit, 512).await;
        let mut deliveries = receiver.deliveries().unwrap();
        receiver.issue_credit(50).unwrap();
        eventually(|| sender.link_credit() == Some(50)).await;

        // More than the credit, faster than the transport drains: the
        // sender's backlog flow is written while transfers are queued.
        for i in 0..60u8 {
            sender.send(Bytes::from(vec![i; 200])).unwrap();
        }
        for i in 0..50u8 {
            let delivery = deliveries.recv().await.unwrap();
            assert_eq!(delivery.payload, Bytes::from(vec![i; 200]));
        }
        // The backlog flow follows the transfers it counts.
        eventually(|| receiver.available() == Some(1)).await;

        assert_eq!(receiver.state(), LinkState::Attached);
        assert_eq!(receiver.error(), None);
        assert_eq!(receiver.link_credit(), Some(0));
        assert_eq!(receiver.delivery_count(), Some(50));
        assert_eq!(sender.delivery_count(), Some(50));
        assert_eq!(sender.available(), Some(10));
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_larger_than_frame_over_connection() {
        let config = Config {
            max_frame_size: 512,
            ..config()
        };
        let (sender, receiver, connections) =
            connected_pair(config, CreditPolicy::Explicit, 64 * 1024).await;
        assert_eq!(connections[0].properties().max_frame_size, 512);
        let mut deliveries = receiver.deliveries().unwrap();
        receiver.issue_credit(5).unwrap();
        eventually(|| sender.link_credit() == Some(5)).await;

        let payload: Bytes = (0..2000u32).map(|i| (i % 251) as u8).collect();
        sender.send(payload.clone()).unwrap();
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.payload, payload);
        assert_eq!(delivery.delivery_id, 0);

        assert_eq!(sender.delivery_count(), Some(1));
        assert_eq!(sender.link_credit(), Some(4));
        eventually(|| receiver.delivery_count() == Some(1)).await;
        assert_eq!(receiver.link_credit(), Some(4));
        assert_eq!(receiver.state(), LinkState::Attached);
        assert_eq!(connections[1].error(), None);
    }

    #[tokio::test]
    async fn test_oversized_message_detaches_receiver() {
        let sink = Arc::new(RecordingSink::default());
        let receiver = Link::new(
            LinkOptions {
                max_message_size: Some(8),
                ..LinkOptions::receiver("in", 1).config(config())
            },
            sink.clone(),
            None,
        );
        receiver.attach();
        receiver.attach_received(Attach {
            name: "in".to_string(),
            handle: 2,
            role: Role::Sender,
            source: None,
            target: None,
            initial_delivery_count: Some(0),
            max_message_size: None,
        });
        receiver.wait_for_attached(Some(TIMEOUT)).await.unwrap();
        receiver.issue_credit(4).unwrap();
        let fragment = |more| Transfer {
            handle: 2,
            delivery_id: 0,
            delivery_tag: Bytes::from_static(b"t"),
            more,
            payload: Bytes::from_static(b"12345"),
        };
        receiver.transfer_received(fragment(true));
        assert_eq!(receiver.state(), LinkState::Attached);
        receiver.transfer_received(fragment(false));
        assert_eq!(receiver.state(), LinkState::DetachSent);
        assert_eq!(
            receiver.error().unwrap().condition,
            condition::MESSAGE_SIZE_EXCEEDED
        );
        let attach = sink
            .take()
            .into_iter()
            .find_map(|performative| performative.into_attach().ok())
            .unwrap();
        assert_eq!(attach.max_message_size, Some(8));
    }
}
