/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Open connections, keyed by remote address and port.

use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;

use dashmap::DashMap;

use super::Connection;
use super::ConnectionKey;
use super::ConnectionRole;
use crate::performative::ErrorCondition;

/// Notified of connection lifecycle events. Both methods are called from
/// the connection's draining thread; they may call back into the
/// connection.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A connection we accepted completed its Open exchange.
    fn connection_accepted(&self, _connection: &Connection) {}

    /// The peer closed the connection identified by `key`.
    fn connection_closed_by_peer(&self, _key: &ConnectionKey, _error: Option<&ErrorCondition>) {}
}

#[derive(Default)]
struct Inner {
    connections: DashMap<ConnectionKey, Connection>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

/// Connections that have completed their Open exchange. Connections
/// register themselves on reaching OPENED and deregister at END.
///
/// Keys compare equal when their remotes match and either port is 0, so
/// a key without a port finds any connection to that remote.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

impl ConnectionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer of connection lifecycle events.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.observers.write().unwrap().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.inner.observers.read().unwrap().clone()
    }

    pub(crate) fn register(&self, connection: &Connection) {
        let key = connection.key();
        if let Some(previous) = self.inner.connections.insert(key.clone(), connection.clone()) {
            if !previous.same(connection) {
                tracing::warn!(key = %key, "replaced a registered connection with the same key");
            }
        }
        tracing::debug!(key = %key, "registered connection");
        if connection.role() == ConnectionRole::Passive {
            for observer in self.observers() {
                observer.connection_accepted(connection);
            }
        }
    }

    /// Remove `connection`, if it is the one registered under its key.
    pub(crate) fn deregister(&self, connection: &Connection) -> bool {
        let key = connection.key();
        let removed = self
            .inner
            .connections
            .remove_if(&key, |_, registered| registered.same(connection))
            .is_some();
        if removed {
            tracing::debug!(key = %key, "deregistered connection");
        }
        removed
    }

    pub(crate) fn notify_closed_by_peer(
        &self,
        key: &ConnectionKey,
        error: Option<&ErrorCondition>,
    ) {
        for observer in self.observers() {
            observer.connection_closed_by_peer(key, error);
        }
    }

    /// Find the connection registered under `key`. A key with port 0
    /// matches a connection to that remote on any port.
    pub fn lookup(&self, key: &ConnectionKey) -> Option<Connection> {
        self.inner
            .connections
            .get(key)
            .map(|entry| entry.value().clone())
    }

    /// Find any connection to `remote`.
    pub fn lookup_remote(&self, remote: &str) -> Option<Connection> {
        self.lookup(&ConnectionKey::new(remote))
    }

    /// Any registered connection.
    pub fn any(&self) -> Option<Connection> {
        self.inner
            .connections
            .iter()
            .next()
            .map(|entry| entry.value().clone())
    }

    /// The distinct remotes with registered connections, sorted.
    pub fn remotes(&self) -> Vec<String> {
        let mut remotes: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().remote().to_string())
            .collect();
        remotes.sort();
        remotes.dedup();
        remotes
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }
}
