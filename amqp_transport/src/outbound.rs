/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Serialized, prioritized writes to a connection's transport.
//!
//! An [`OutboundSender`] owns the write half of a transport. Buffers are
//! queued in two classes: control (protocol headers and connection
//! frames) and data (everything sent on a session channel). At most one
//! write is in flight at a time; while it is, further sends only enqueue,
//! and the write task dequeues the next buffer when the current one
//! completes, preferring control buffers.
//!
//! Closing is graceful: a close requested while writes are pending is
//! deferred until the queue has drained, after which the writer is shut
//! down. [`OutboundSender::force_close`] discards whatever is still queued
//! and abandons a write stalled on the transport.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::actor::WaitError;
use crate::frame::FrameError;
use crate::init::get_runtime;
use crate::performative::CodecError;

/// Errors returned when submitting outbound data.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The sender is closing or closed.
    #[error("sender is closed")]
    Closed,
    /// The performative could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The encoded frame could not be built.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Queue class for an outbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Protocol headers and connection frames. Written ahead of data.
    Control,
    /// Session and link frames.
    Data,
}

/// Lifecycle of an [`OutboundSender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    /// Accepting sends.
    Active,
    /// Close requested; draining queued writes.
    Closing,
    /// Queue drained and writer shut down.
    Closed,
    /// A write failed; queued buffers were discarded.
    Failed,
}

impl SenderStatus {
    /// Whether the sender has stopped writing for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, SenderStatus::Closed | SenderStatus::Failed)
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type FailureHook = Box<dyn Fn(&io::Error) + Send + Sync>;

struct State {
    control: VecDeque<Bytes>,
    data: VecDeque<Bytes>,
    // Present when no write task is running.
    writer: Option<Writer>,
    writing: bool,
    close_requested: bool,
    writes_completed: u64,
}

impl State {
    fn pop(&mut self) -> Option<Bytes> {
        self.control.pop_front().or_else(|| self.data.pop_front())
    }
}

struct Inner {
    log_id: String,
    state: Mutex<State>,
    status: watch::Sender<SenderStatus>,
    on_failure: Option<FailureHook>,
    // Cancelled by a forced close.
    abandon: CancellationToken,
}

/// Serializes writes to a transport. Cloning yields another handle to the
/// same sender.
#[derive(Clone)]
pub struct OutboundSender {
    inner: Arc<Inner>,
}

impl fmt::Debug for OutboundSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSender")
            .field("log_id", &self.inner.log_id)
            .field("status", &self.status())
            .finish()
    }
}

impl OutboundSender {
    /// Create a sender writing to `writer`.
    pub fn new(
        log_id: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::build(log_id.into(), Box::new(writer), None)
    }

    /// Create a sender that reports write failures to `on_failure`. The hook
    /// runs on the write task after the queue has been discarded.
    pub fn with_failure_hook(
        log_id: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        on_failure: impl Fn(&io::Error) + Send + Sync + 'static,
    ) -> Self {
        Self::build(log_id.into(), Box::new(writer), Some(Box::new(on_failure)))
    }

    fn build(log_id: String, writer: Writer, on_failure: Option<FailureHook>) -> Self {
        let (status, _) = watch::channel(SenderStatus::Active);
        Self {
            inner: Arc::new(Inner {
                log_id,
                state: Mutex::new(State {
                    control: VecDeque::new(),
                    data: VecDeque::new(),
                    writer: Some(writer),
                    writing: false,
                    close_requested: false,
                    writes_completed: 0,
                }),
                status,
                on_failure,
                abandon: CancellationToken::new(),
            }),
        }
    }

    /// Submit `buf` for writing. Buffers of the same class are written in
    /// submission order.
    pub fn send(&self, buf: Bytes, priority: Priority) -> Result<(), SendError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.close_requested {
            return Err(SendError::Closed);
        }
        match priority {
            Priority::Control => state.control.push_back(buf),
            Priority::Data => state.data.push_back(buf),
        }
        if state.writing {
            return Ok(());
        }
        let Some(writer) = state.writer.take() else {
            return Err(SendError::Closed);
        };
        state.writing = true;
        drop(state);

        get_runtime().spawn(Arc::clone(&self.inner).write_loop(writer));
        Ok(())
    }

    /// Close after everything queued has been written. Idempotent.
    pub fn close(&self) {
        self.request_close(false);
    }

    /// Close, discarding queued buffers. A write already in flight is
    /// abandoned and the writer dropped without a shutdown.
    pub fn force_close(&self) {
        self.request_close(true);
        self.inner.abandon.cancel();
    }

    fn request_close(&self, discard: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if discard {
            let discarded = state.control.len() + state.data.len();
            state.control.clear();
            state.data.clear();
            if discarded > 0 {
                tracing::debug!(
                    log_id = self.inner.log_id,
                    discarded,
                    "discarding queued writes"
                );
            }
        }
        if state.close_requested {
            return;
        }
        state.close_requested = true;
        self.inner.status.send_if_modified(|status| {
            if *status == SenderStatus::Active {
                *status = SenderStatus::Closing;
                true
            } else {
                false
            }
        });
        if state.writing {
            // The write task finishes the close once the queue is empty.
            return;
        }
        let Some(writer) = state.writer.take() else {
            return;
        };
        state.writing = true;
        drop(state);

        get_runtime().spawn(Arc::clone(&self.inner).write_loop(writer));
    }

    /// The sender's current status.
    pub fn status(&self) -> SenderStatus {
        *self.inner.status.borrow()
    }

    /// Number of buffers queued and not yet handed to the writer.
    pub fn queued(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.control.len() + state.data.len()
    }

    /// Number of writes that have completed.
    pub fn writes_completed(&self) -> u64 {
        self.inner.state.lock().unwrap().writes_completed
    }

    /// Wait until the sender has closed or failed.
    pub async fn wait_for_close(
        &self,
        timeout: Option<Duration>,
    ) -> Result<SenderStatus, WaitError> {
        let mut status = self.inner.status.subscribe();
        let wait = async move {
            #[allow(clippy::let_and_return)]
            let result = status
                .wait_for(|status| status.is_terminal())
                .await
                .map(|status| *status);
            result
        };
        match timeout {
            None => wait.await.map_err(|_| WaitError::Terminated),
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| WaitError::Timeout)?
                .map_err(|_| WaitError::Terminated),
        }
    }
}

impl Inner {
    async fn write_loop(self: Arc<Self>, mut writer: Writer) {
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.pop() {
                    Some(buf) => buf,
                    None if state.close_requested => break,
                    None => {
                        state.writer = Some(writer);
                        state.writing = false;
                        return;
                    }
                }
            };
            let written = tokio::select! {
                biased;
                _ = self.abandon.cancelled() => break,
                written = write_buf(&mut writer, &next) => written,
            };
            if let Err(err) = written {
                self.fail(err);
                return;
            }
            self.state.lock().unwrap().writes_completed += 1;
        }

        tokio::select! {
            biased;
            _ = self.abandon.cancelled() => {
                tracing::debug!(log_id = self.log_id, "abandoning writer");
            }
            shutdown = writer.shutdown() => {
                if let Err(err) = shutdown {
                    tracing::debug!(log_id = self.log_id, error = %err, "shutdown failed");
                }
            }
        }
        drop(writer);
        self.state.lock().unwrap().writing = false;
        tracing::debug!(log_id = self.log_id, "sender closed");
        self.status.send_replace(SenderStatus::Closed);
    }

    fn fail(&self, err: io::Error) {
        {
            let mut state = self.state.lock().unwrap();
            state.control.clear();
            state.data.clear();
            state.close_requested = true;
            state.writing = false;
        }
        tracing::warn!(log_id = self.log_id, error = %err, "write failed");
        self.status.send_replace(SenderStatus::Failed);
        if let Some(on_failure) = &self.on_failure {
            on_failure(&err);
        }
    }
}

async fn write_buf(writer: &mut Writer, buf: &[u8]) -> io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}
