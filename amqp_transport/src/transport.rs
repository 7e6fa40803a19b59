/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! TCP transport: dialing, accepting, and the per-connection reader task.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::connection::ConnectionError;
use crate::connection::ConnectionOptions;
use crate::connection::ConnectionRegistry;
use crate::connection::ConnectionRole;
use crate::frame::FrameReader;
use crate::init::get_runtime;

/// Spawn a task feeding `reader` into `connection`: the protocol header
/// first, then frames. The task exits when the connection ends; a read
/// error or end of stream before that aborts the connection.
pub fn spawn_reader(
    connection: Connection,
    reader: impl AsyncRead + Send + Unpin + 'static,
) -> JoinHandle<()> {
    let max_frame_size = connection.properties().max_frame_size as usize;
    get_runtime().spawn(async move {
        let ended = {
            let connection = connection.clone();
            async move { connection.wait_for_end(None).await }
        };
        tokio::pin!(ended);
        let mut frames = FrameReader::new(reader, max_frame_size);

        let result: anyhow::Result<()> = async {
            let header = tokio::select! {
                biased;
                _ = &mut ended => return Ok(()),
                header = frames.read_protocol_header() => {
                    header.context("reading protocol header")?
                }
            };
            let header = header.context("stream closed before protocol header")?;
            connection.header_received(header);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut ended => return Ok(()),
                    frame = frames.next() => match frame.context("reading frame")? {
                        Some(frame) => connection.frame_received(frame),
                        None => anyhow::bail!("stream closed"),
                    },
                }
            }
        }
        .await;

        if let Err(err) = result {
            tracing::debug!(
                connection = ?connection.key(),
                error = %format!("{:#}", err),
                "reader stopped"
            );
            connection.transport_closed(format!("{:#}", err));
        }
    })
}

/// Connect to `host:port`, send our header and Open, and wait (up to the
/// configured open timeout) for the Open exchange to complete.
pub async fn connect(
    host: &str,
    port: u16,
    registry: ConnectionRegistry,
    options: ConnectionOptions,
) -> Result<Connection, ConnectionError> {
    let address = format!("{}:{}", host, port);
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| ConnectionError::Connect(address.clone(), err))?;
    stream.set_nodelay(true)?;
    // Keyed by our end's port, so connections to one broker stay distinct.
    let local_port = stream.local_addr()?.port();
    let (reader, writer) = stream.into_split();

    let open_timeout = options.config.open_timeout;
    let connection = Connection::new(host, ConnectionRole::Active, writer, registry, options);
    connection.set_port(local_port);
    spawn_reader(connection.clone(), reader);
    connection.send_header();
    connection.send_open();

    if let Err(err) = connection.wait_for_open_exchange(Some(open_timeout)).await {
        tracing::warn!(address, error = %err, "open exchange failed");
        connection.transport_closed(format!("open exchange failed: {}", err));
        return Err(err.into());
    }
    Ok(connection)
}

/// Accepts TCP connections and runs the passive side of each. Accepted
/// connections reach the registry (and its observers) once their Open
/// exchange completes.
#[derive(Debug)]
pub struct Acceptor {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Acceptor {
    /// Bind to `addr` and start accepting.
    pub async fn bind(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        registry: ConnectionRegistry,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let description = format!("{:?}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ConnectionError::Bind(description, err))?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let handle = get_runtime().spawn(accept_loop(
            listener,
            registry,
            options,
            cancel.clone(),
        ));
        tracing::info!(%local_addr, "accepting connections");
        Ok(Self {
            local_addr,
            cancel,
            handle,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Established connections are unaffected.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Err(err) = (&mut self.handle).await {
            tracing::warn!(error = %err, "accept loop panicked");
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: ConnectionRegistry,
    options: ConnectionOptions,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            },
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "set_nodelay failed");
        }
        tracing::debug!(%peer, "accepted transport");
        let (reader, writer) = stream.into_split();
        let connection = Connection::new(
            peer.ip().to_string(),
            ConnectionRole::Passive,
            writer,
            registry.clone(),
            options.clone(),
        );
        connection.set_port(peer.port());
        spawn_reader(connection, reader);
    }
    tracing::debug!("acceptor stopped");
}
