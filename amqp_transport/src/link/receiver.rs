/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The receiving end of a link's flow control.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use bytes::BytesMut;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::FrameSink;
use crate::performative::ErrorCondition;
use crate::performative::Flow;
use crate::performative::Performative;
use crate::performative::Transfer;
use crate::performative::condition;

/// How a receiver link grants credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditPolicy {
    /// Credit is granted only by [`crate::link::Link::issue_credit`].
    Explicit,
    /// Start with `boost` credit and add `boost` more whenever credit
    /// falls below `low_water`.
    Auto {
        /// Top up below this much credit.
        low_water: u32,
        /// Credit added per top-up.
        boost: u32,
    },
    /// Grant exactly as much credit as the sender reports available.
    Demand,
}

impl CreditPolicy {
    /// An auto-replenishing policy using the thresholds in `config`.
    pub fn auto(config: &Config) -> Self {
        CreditPolicy::Auto {
            low_water: config.auto_credit_low_water,
            boost: config.auto_credit_boost,
        }
    }
}

/// A complete message received on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Delivery id of the first transfer frame.
    pub delivery_id: u32,
    /// The sender's tag.
    pub delivery_tag: Bytes,
    /// The reassembled payload.
    pub payload: Bytes,
}

struct Partial {
    delivery_id: u32,
    delivery_tag: Bytes,
    payload: BytesMut,
}

struct ReceiverState {
    delivery_count: u32,
    link_credit: i64,
    available: u32,
    drain: bool,
    partial: Option<Partial>,
}

pub(crate) struct ReceiverEndpoint {
    handle: u32,
    log_id: String,
    sink: Arc<dyn FrameSink>,
    policy: CreditPolicy,
    violation_threshold: i64,
    max_message_size: Option<u64>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    state: Mutex<ReceiverState>,
}

impl ReceiverEndpoint {
    pub(crate) fn new(
        handle: u32,
        log_id: String,
        sink: Arc<dyn FrameSink>,
        initial_delivery_count: u32,
        policy: CreditPolicy,
        config: &Config,
        max_message_size: Option<u64>,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            handle,
            log_id,
            sink,
            policy,
            violation_threshold: config.credit_violation_threshold as i64,
            max_message_size: max_message_size.filter(|max| *max > 0),
            deliveries,
            state: Mutex::new(ReceiverState {
                delivery_count: initial_delivery_count,
                link_credit: 0,
                available: 0,
                drain: false,
                partial: None,
            }),
        }
    }

    /// Send the initial flow the policy calls for.
    pub(crate) fn start(&self) {
        match self.policy {
            CreditPolicy::Auto { boost, .. } => self.issue_credit(boost),
            // Ask the sender what it has.
            CreditPolicy::Demand => {
                let flow = self.flow(&self.state.lock().unwrap(), true);
                self.send_flow(flow);
            }
            CreditPolicy::Explicit => (),
        }
    }

    /// Handle one transfer frame. Returns the error to detach with if the
    /// sender has overrun its credit, exceeded our message size, or
    /// interleaved another delivery into a partial one.
    pub(crate) fn transfer_received(&self, transfer: Transfer) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let incomplete = state.partial.as_ref().map(|partial| partial.delivery_id);
        if let Some(expected) = incomplete.filter(|id| *id != transfer.delivery_id) {
            state.partial = None;
            return Err(ErrorCondition::new(
                condition::NOT_ALLOWED,
                format!(
                    "transfer {} interrupts incomplete delivery {}",
                    transfer.delivery_id, expected
                ),
            ));
        }
        let buffered = state.partial.as_ref().map_or(0, |partial| partial.payload.len());
        if let Some(max) = self.max_message_size {
            let size = (buffered + transfer.payload.len()) as u64;
            if size > max {
                state.partial = None;
                return Err(ErrorCondition::new(
                    condition::MESSAGE_SIZE_EXCEEDED,
                    format!(
                        "delivery {} reached {} bytes; the limit is {}",
                        transfer.delivery_id, size, max
                    ),
                ));
            }
        }
        let delivery = match (state.partial.take(), transfer.more) {
            (None, true) => {
                state.partial = Some(Partial {
                    delivery_id: transfer.delivery_id,
                    delivery_tag: transfer.delivery_tag,
                    payload: BytesMut::from(&transfer.payload[..]),
                });
                return Ok(());
            }
            (Some(mut partial), more) => {
                partial.payload.extend_from_slice(&transfer.payload);
                if more {
                    state.partial = Some(partial);
                    return Ok(());
                }
                Delivery {
                    delivery_id: partial.delivery_id,
                    delivery_tag: partial.delivery_tag,
                    payload: partial.payload.freeze(),
                }
            }
            (None, false) => Delivery {
                delivery_id: transfer.delivery_id,
                delivery_tag: transfer.delivery_tag,
                payload: transfer.payload,
            },
        };

        state.delivery_count = state.delivery_count.wrapping_add(1);
        state.link_credit -= 1;
        state.available = state.available.saturating_sub(1);
        if state.link_credit < -self.violation_threshold {
            return Err(ErrorCondition::new(
                condition::TRANSFER_LIMIT_EXCEEDED,
                format!(
                    "credit at {} exceeds the allowed overrun of {}",
                    state.link_credit, self.violation_threshold
                ),
            ));
        }
        if self.deliveries.send(delivery).is_err() {
            tracing::debug!(log_id = self.log_id, "no consumer; dropping delivery");
        }

        let reply = match self.policy {
            CreditPolicy::Auto { low_water, boost } if state.link_credit < low_water as i64 => {
                state.link_credit = state.link_credit.max(0) + boost as i64;
                Some(self.flow(&state, false))
            }
            _ => None,
        };
        drop(state);
        if let Some(flow) = reply {
            self.send_flow(flow);
        }
        Ok(())
    }

    /// Apply the sender's flow state.
    pub(crate) fn flow_received(&self, flow: &Flow) {
        let mut state = self.state.lock().unwrap();
        state.available = flow.available;
        if flow.drain && state.drain {
            // The sender answers a drain by advancing its delivery count
            // over the credit it gave back; that credit is gone. Any other
            // flow's delivery count may run ahead of transfers still in
            // flight and is only informational.
            let advanced = flow.delivery_count.wrapping_sub(state.delivery_count) as i32;
            if advanced > 0 {
                state.delivery_count = flow.delivery_count;
                state.link_credit -= advanced as i64;
            }
            tracing::debug!(log_id = self.log_id, "drain complete");
            state.drain = false;
        }

        let grant = match self.policy {
            CreditPolicy::Demand if state.available as i64 > state.link_credit.max(0) => {
                state.link_credit = state.available as i64;
                true
            }
            CreditPolicy::Auto { low_water, boost }
                if !state.drain && state.available > 0 && state.link_credit < low_water as i64 =>
            {
                state.link_credit = state.link_credit.max(0) + boost as i64;
                true
            }
            _ => false,
        };
        let reply = (grant || flow.echo).then(|| self.flow(&state, false));
        drop(state);
        if let Some(flow) = reply {
            self.send_flow(flow);
        }
    }

    /// Grant `credit` more.
    pub(crate) fn issue_credit(&self, credit: u32) {
        let mut state = self.state.lock().unwrap();
        state.link_credit = state.link_credit.max(0) + credit as i64;
        let flow = self.flow(&state, false);
        drop(state);
        self.send_flow(flow);
    }

    /// Ask the sender to use up or return its credit.
    pub(crate) fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        state.drain = true;
        let flow = self.flow(&state, false);
        drop(state);
        self.send_flow(flow);
    }

    pub(crate) fn link_credit(&self) -> i64 {
        self.state.lock().unwrap().link_credit
    }

    pub(crate) fn delivery_count(&self) -> u32 {
        self.state.lock().unwrap().delivery_count
    }

    pub(crate) fn available(&self) -> u32 {
        self.state.lock().unwrap().available
    }

    pub(crate) fn draining(&self) -> bool {
        self.state.lock().unwrap().drain
    }

    fn flow(&self, state: &ReceiverState, echo: bool) -> Flow {
        Flow {
            handle: self.handle,
            delivery_count: state.delivery_count,
            link_credit: state.link_credit.max(0) as u32,
            available: state.available,
            drain: state.drain,
            echo,
        }
    }

    fn send_flow(&self, flow: Flow) {
        if let Err(err) = self.sink.send(Performative::Flow(flow)) {
            tracing::debug!(log_id = self.log_id, error = %err, "flow not sent");
        }
    }
}
