/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The sending end of a link's flow control.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bytes::Bytes;

use super::LinkError;
use crate::config::Config;
use crate::connection::FrameSink;
use crate::outbound::SendError;
use crate::performative::ErrorCondition;
use crate::performative::Flow;
use crate::performative::Performative;
use crate::performative::Transfer;
use crate::performative::condition;

/// Length of the delivery tags this end assigns.
pub(crate) const DELIVERY_TAG_LEN: usize = std::mem::size_of::<u64>();

struct SenderState {
    delivery_count: u32,
    // May be negative transiently; never below the violation threshold.
    link_credit: i64,
    queue: VecDeque<Bytes>,
    send_in_progress: bool,
    drain: bool,
    echo_pending: bool,
    // Whether the peer has been told about our backlog since credit last
    // ran out.
    advertised: bool,
    next_tag: u64,
}

impl SenderState {
    fn blocked(&self) -> bool {
        !self.queue.is_empty() && self.link_credit <= 0
    }
}

pub(crate) struct SenderEndpoint {
    handle: u32,
    log_id: String,
    sink: Arc<dyn FrameSink>,
    violation_threshold: i64,
    available_limit: u32,
    max_message_size: Option<u64>,
    max_fragment_size: Option<usize>,
    state: Mutex<SenderState>,
}

impl SenderEndpoint {
    pub(crate) fn new(
        handle: u32,
        log_id: String,
        sink: Arc<dyn FrameSink>,
        initial_delivery_count: u32,
        config: &Config,
        max_message_size: Option<u64>,
        max_fragment_size: Option<usize>,
    ) -> Self {
        Self {
            handle,
            log_id,
            sink,
            violation_threshold: config.credit_violation_threshold as i64,
            available_limit: config.available_limit,
            max_message_size,
            max_fragment_size,
            state: Mutex::new(SenderState {
                delivery_count: initial_delivery_count,
                link_credit: 0,
                queue: VecDeque::new(),
                send_in_progress: false,
                drain: false,
                echo_pending: false,
                advertised: false,
                next_tag: 0,
            }),
        }
    }

    /// Queue `payload` for transfer. Returns whether the link is blocked
    /// on credit afterwards.
    pub(crate) fn send(&self, payload: Bytes) -> Result<bool, LinkError> {
        if let Some(max) = self.max_message_size {
            let size = payload.len() as u64;
            if max > 0 && size > max {
                return Err(LinkError::MessageTooLarge { size, max });
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.queue.len() >= self.available_limit as usize {
            return Err(LinkError::AvailableLimitReached {
                limit: self.available_limit,
            });
        }
        state.queue.push_back(payload);
        Ok(self.pump(state))
    }

    /// Apply the receiver's flow state. Returns whether the link is
    /// blocked afterwards, or the error to detach with if the receiver's
    /// view of credit is irreconcilable with ours.
    pub(crate) fn flow_received(&self, flow: &Flow) -> Result<bool, ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        // Transfers the receiver had not yet seen when it sent this flow.
        let in_flight = state.delivery_count.wrapping_sub(flow.delivery_count) as i32 as i64;
        let credit = flow.link_credit as i64 - in_flight;
        if credit < -self.violation_threshold {
            return Err(ErrorCondition::new(
                condition::TRANSFER_LIMIT_EXCEEDED,
                format!(
                    "receiver reports delivery count {} with credit {} against our {}",
                    flow.delivery_count, flow.link_credit, state.delivery_count
                ),
            ));
        }
        state.link_credit = credit.max(0);
        if state.link_credit > 0 {
            state.advertised = false;
        }
        state.drain = flow.drain;
        state.echo_pending |= flow.echo;
        tracing::trace!(
            log_id = self.log_id,
            credit = state.link_credit,
            drain = state.drain,
            "credit updated"
        );
        Ok(self.pump(state))
    }

    /// Ask the receiver for credit if still blocked.
    pub(crate) fn request_credit(&self) -> bool {
        let state = self.state.lock().unwrap();
        if !state.blocked() {
            return false;
        }
        let flow = self.flow(&state, false, true);
        drop(state);
        self.send_flow(flow);
        true
    }

    pub(crate) fn link_credit(&self) -> i64 {
        self.state.lock().unwrap().link_credit
    }

    pub(crate) fn delivery_count(&self) -> u32 {
        self.state.lock().unwrap().delivery_count
    }

    pub(crate) fn available(&self) -> u32 {
        self.state.lock().unwrap().queue.len() as u32
    }

    /// Transfer queued messages while credit lasts, then answer drain and
    /// echo requests. Only one caller pumps at a time; the others leave
    /// their work in the state for it.
    fn pump<'a>(&'a self, mut state: MutexGuard<'a, SenderState>) -> bool {
        if state.send_in_progress {
            return state.blocked();
        }
        state.send_in_progress = true;
        while state.link_credit > 0 {
            let Some(payload) = state.queue.pop_front() else {
                break;
            };
            state.link_credit -= 1;
            let delivery_id = state.delivery_count;
            state.delivery_count = state.delivery_count.wrapping_add(1);
            let tag = Bytes::copy_from_slice(&state.next_tag.to_be_bytes());
            state.next_tag += 1;
            drop(state);

            let result = self.transmit(delivery_id, tag, payload.clone());
            state = self.state.lock().unwrap();
            match result {
                Ok(()) => {}
                Err((0, err)) => {
                    // Nothing reached the wire: the message is still ours.
                    tracing::warn!(log_id = self.log_id, error = %err, "transfer not sent");
                    state.queue.push_front(payload);
                    state.link_credit += 1;
                    state.delivery_count = state.delivery_count.wrapping_sub(1);
                    state.next_tag -= 1;
                    break;
                }
                Err((sent, err)) => {
                    tracing::warn!(
                        log_id = self.log_id,
                        error = %err,
                        fragments = sent,
                        "transfer failed after partial send"
                    );
                    break;
                }
            }
        }
        state.send_in_progress = false;

        let reply = if state.drain {
            // Give back whatever credit is left by advancing the delivery
            // count over it.
            let leftover = state.link_credit.max(0);
            state.delivery_count = state.delivery_count.wrapping_add(leftover as u32);
            state.link_credit = 0;
            state.drain = false;
            state.echo_pending = false;
            Some(self.flow(&state, true, false))
        } else if state.echo_pending {
            state.echo_pending = false;
            Some(self.flow(&state, false, false))
        } else if state.blocked() && !state.advertised {
            state.advertised = true;
            Some(self.flow(&state, false, false))
        } else {
            None
        };
        let blocked = state.blocked();
        drop(state);

        if let Some(flow) = reply {
            self.send_flow(flow);
        }
        blocked
    }

    /// Largest transfer payload per frame: the configured fragment size,
    /// further bounded by what the sink can carry.
    fn fragment_size(&self) -> Option<usize> {
        match (self.max_fragment_size, self.sink.max_payload_size()) {
            (Some(configured), Some(frame)) => Some(configured.min(frame)),
            (configured, frame) => configured.or(frame),
        }
    }

    /// Send `payload` as one or more transfer frames. On failure, reports
    /// how many frames went out before it.
    fn transmit(
        &self,
        delivery_id: u32,
        tag: Bytes,
        payload: Bytes,
    ) -> Result<(), (usize, SendError)> {
        let fragments: Vec<Bytes> = match self.fragment_size() {
            Some(max) if payload.len() > max.max(1) => {
                let max = max.max(1);
                (0..payload.len())
                    .step_by(max)
                    .map(|start| payload.slice(start..(start + max).min(payload.len())))
                    .collect()
            }
            _ => vec![payload],
        };
        let last = fragments.len() - 1;
        for (index, fragment) in fragments.into_iter().enumerate() {
            self.sink
                .send(Performative::Transfer(Transfer {
                    handle: self.handle,
                    delivery_id,
                    delivery_tag: tag.clone(),
                    more: index < last,
                    payload: fragment,
                }))
                .map_err(|err| (index, err))?;
        }
        Ok(())
    }

    fn flow(&self, state: &SenderState, drain: bool, echo: bool) -> Flow {
        Flow {
            handle: self.handle,
            delivery_count: state.delivery_count,
            link_credit: state.link_credit.max(0) as u32,
            available: state.queue.len() as u32,
            drain,
            echo,
        }
    }

    fn send_flow(&self, flow: Flow) {
        if let Err(err) = self.sink.send(Performative::Flow(flow)) {
            tracing::debug!(log_id = self.log_id, error = %err, "flow not sent");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records everything sent through it.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<Performative>>,
        pub(crate) max_payload: Option<usize>,
        // Transfers to reject before accepting again.
        pub(crate) reject_transfers: Mutex<usize>,
    }

    impl RecordingSink {
        pub(crate) fn take(&self) -> Vec<Performative> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, performative: Performative) -> Result<(), SendError> {
            if performative.is_transfer() {
                let mut reject = self.reject_transfers.lock().unwrap();
                if *reject > 0 {
                    *reject -= 1;
                    return Err(SendError::Closed);
                }
            }
            self.sent.lock().unwrap().push(performative);
            Ok(())
        }

        fn max_payload_size(&self) -> Option<usize> {
            self.max_payload
        }
    }

    fn endpoint(initial_delivery_count: u32) -> (Arc<RecordingSink>, SenderEndpoint) {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            credit_violation_threshold: 10,
            available_limit: 4,
            ..Config::default()
        };
        let endpoint = SenderEndpoint::new(
            0,
            "test".to_string(),
            sink.clone(),
            initial_delivery_count,
            &config,
            Some(1024),
            None,
        );
        (sink, endpoint)
    }

    fn credit(delivery_count: u32, link_credit: u32) -> Flow {
        Flow {
            delivery_count,
            link_credit,
            ..Flow::default()
        }
    }

    fn transfers(sent: &[Performative]) -> Vec<Bytes> {
        sent.iter()
            .filter_map(|performative| performative.as_transfer())
            .map(|transfer| transfer.payload.clone())
            .collect()
    }

    #[test]
    fn test_blocked_until_credit() {
        let (sink, endpoint) = endpoint(0);
        assert!(endpoint.send(Bytes::from_static(b"a")).unwrap());
        assert!(endpoint.send(Bytes::from_static(b"b")).unwrap());
        assert!(endpoint.send(Bytes::from_static(b"c")).unwrap());
        // Only the first blocked send advertises the backlog.
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_flow().unwrap().available, 1);

        assert!(endpoint.flow_received(&credit(0, 2)).unwrap());
        let sent = sink.take();
        assert_eq!(transfers(&sent), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let advert = sent.last().unwrap().as_flow().unwrap();
        assert_eq!((advert.delivery_count, advert.available), (2, 1));

        // The receiver hasn't seen our two transfers yet: 3 - 2 = 1.
        assert!(!endpoint.flow_received(&credit(0, 3)).unwrap());
        assert_eq!(transfers(&sink.take()), vec![Bytes::from_static(b"c")]);
        assert_eq!(endpoint.link_credit(), 0);
        assert_eq!(endpoint.delivery_count(), 3);
    }

    #[test]
    fn test_drain_gives_back_credit() {
        let (sink, endpoint) = endpoint(7);
        let drain = Flow {
            drain: true,
            ..credit(7, 4)
        };
        assert!(!endpoint.flow_received(&drain).unwrap());
        let sent = sink.take();
        let reply = sent[0].as_flow().unwrap();
        assert_eq!(reply.link_credit, 0);
        assert_eq!(reply.delivery_count, 11);
        assert!(reply.drain);
        assert_eq!(endpoint.delivery_count(), 11);

        // Drain with messages queued sends them first.
        endpoint.send(Bytes::from_static(b"x")).unwrap();
        sink.take();
        let drain = Flow {
            drain: true,
            ..credit(11, 3)
        };
        endpoint.flow_received(&drain).unwrap();
        let sent = sink.take();
        assert_eq!(transfers(&sent), vec![Bytes::from_static(b"x")]);
        assert_eq!(sent.last().unwrap().as_flow().unwrap().delivery_count, 14);
    }

    #[test]
    fn test_echo() {
        let (sink, endpoint) = endpoint(0);
        let echo = Flow {
            echo: true,
            ..credit(0, 5)
        };
        endpoint.flow_received(&echo).unwrap();
        let sent = sink.take();
        let reply = sent[0].as_flow().unwrap();
        assert_eq!(reply.link_credit, 5);
        assert!(!reply.echo);
    }

    #[test]
    fn test_credit_violation() {
        let (_sink, endpoint) = endpoint(0);
        endpoint.flow_received(&credit(0, 20)).unwrap();
        for _ in 0..4 {
            endpoint.send(Bytes::from_static(b"m")).unwrap();
        }
        for _ in 0..4 {
            endpoint.send(Bytes::from_static(b"m")).unwrap();
        }
        assert_eq!(endpoint.delivery_count(), 8);
        // Stale by 8 with no credit: tolerated, treated as zero.
        assert!(endpoint.flow_received(&credit(0, 0)).is_ok());
        assert_eq!(endpoint.link_credit(), 0);

        let (_sink, endpoint) = endpoint_with_sent(20);
        let err = endpoint.flow_received(&credit(5, 0)).unwrap_err();
        assert_eq!(err.condition, condition::TRANSFER_LIMIT_EXCEEDED);
    }

    fn endpoint_with_sent(count: u32) -> (Arc<RecordingSink>, SenderEndpoint) {
        let (sink, endpoint) = endpoint(0);
        endpoint.flow_received(&credit(0, count)).unwrap();
        for _ in 0..count {
            endpoint.send(Bytes::from_static(b"m")).unwrap();
        }
        assert_eq!(endpoint.delivery_count(), count);
        (sink, endpoint)
    }

    #[test]
    fn test_delivery_count_wraps() {
        let (sink, endpoint) = endpoint(u32::MAX - 1);
        endpoint.flow_received(&credit(u32::MAX - 1, 3)).unwrap();
        for _ in 0..3 {
            endpoint.send(Bytes::from_static(b"w")).unwrap();
        }
        assert_eq!(endpoint.delivery_count(), 1);
        let ids: Vec<u32> = sink
            .take()
            .iter()
            .filter_map(|performative| performative.as_transfer())
            .map(|transfer| transfer.delivery_id)
            .collect();
        assert_eq!(ids, vec![u32::MAX - 1, u32::MAX, 0]);
        // The receiver saw everything and grants two more.
        endpoint.flow_received(&credit(1, 2)).unwrap();
        assert_eq!(endpoint.link_credit(), 2);
    }

    #[test]
    fn test_limits() {
        let (_sink, endpoint) = endpoint(0);
        for _ in 0..4 {
            endpoint.send(Bytes::from_static(b"q")).unwrap();
        }
        assert!(matches!(
            endpoint.send(Bytes::from_static(b"q")),
            Err(LinkError::AvailableLimitReached { limit: 4 })
        ));
        assert!(matches!(
            endpoint.send(Bytes::from(vec![0u8; 2048])),
            Err(LinkError::MessageTooLarge { size: 2048, max: 1024 })
        ));
        assert_eq!(endpoint.available(), 4);
        assert!(endpoint.request_credit());
    }

    #[test]
    fn test_fragments() {
        let sink = Arc::new(RecordingSink::default());
        let endpoint = SenderEndpoint::new(
            3,
            "test".to_string(),
            sink.clone(),
            0,
            &Config::default(),
            None,
            Some(4),
        );
        endpoint.flow_received(&credit(0, 1)).unwrap();
        endpoint.send(Bytes::from_static(b"0123456789")).unwrap();
        let sent = sink.take();
        let fragments: Vec<(bool, Bytes)> = sent
            .iter()
            .filter_map(|performative| performative.as_transfer())
            .map(|transfer| (transfer.more, transfer.payload.clone()))
            .collect();
        assert_eq!(
            fragments,
            vec![
                (true, Bytes::from_static(b"0123")),
                (true, Bytes::from_static(b"4567")),
                (false, Bytes::from_static(b"89")),
            ]
        );
        assert_eq!(endpoint.delivery_count(), 1);
    }

    #[test]
    fn test_fragments_fit_sink() {
        let sink = Arc::new(RecordingSink {
            max_payload: Some(3),
            ..RecordingSink::default()
        });
        let endpoint = SenderEndpoint::new(
            0,
            "test".to_string(),
            sink.clone(),
            0,
            &Config::default(),
            None,
            Some(4),
        );
        endpoint.flow_received(&credit(0, 1)).unwrap();
        endpoint.send(Bytes::from_static(b"abcdefg")).unwrap();
        let sent = sink.take();
        let fragments: Vec<(u32, bool, Bytes)> = sent
            .iter()
            .filter_map(|performative| performative.as_transfer())
            .map(|transfer| (transfer.delivery_id, transfer.more, transfer.payload.clone()))
            .collect();
        assert_eq!(
            fragments,
            vec![
                (0, true, Bytes::from_static(b"abc")),
                (0, true, Bytes::from_static(b"def")),
                (0, false, Bytes::from_static(b"g")),
            ]
        );
    }

    #[test]
    fn test_unsent_transfer_keeps_credit() {
        let (sink, endpoint) = endpoint(5);
        *sink.reject_transfers.lock().unwrap() = 1;
        endpoint.flow_received(&credit(5, 2)).unwrap();
        endpoint.send(Bytes::from_static(b"first")).unwrap();
        assert!(transfers(&sink.take()).is_empty());
        assert_eq!(endpoint.link_credit(), 2);
        assert_eq!(endpoint.delivery_count(), 5);
        assert_eq!(endpoint.available(), 1);

        // The next pump retries it ahead of later messages, same tag.
        endpoint.send(Bytes::from_static(b"second")).unwrap();
        let sent = sink.take();
        let sent: Vec<&Transfer> = sent
            .iter()
            .filter_map(|performative| performative.as_transfer())
            .collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload, Bytes::from_static(b"first"));
        assert_eq!(sent[0].delivery_id, 5);
        assert_eq!(sent[0].delivery_tag, Bytes::copy_from_slice(&0u64.to_be_bytes()));
        assert_eq!(sent[1].payload, Bytes::from_static(b"second"));
        assert_eq!(sent[1].delivery_id, 6);
        assert_eq!(endpoint.link_credit(), 0);
        assert_eq!(endpoint.delivery_count(), 7);
    }
}
