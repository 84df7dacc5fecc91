//! Server-side directory of registered nicknames.
//!
//! Every operation holds the registry lock only for its own lookup, mutation
//! or copy. Delivery to clients goes through each connection's bounded
//! outbound queue, which never blocks the pusher, so join and leave notices
//! are queued while the lock is held and broadcasts after it is released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use huddle_protocol::{Command, UserEntry};

/// Identifies one accepted connection for the lifetime of the server.
pub type ConnectionId = u64;

/// Outbound side of one client connection.
///
/// Pushing never blocks: commands are queued and written to the socket by the
/// connection's own writer task. A client whose queue is full is not keeping
/// up and gets evicted.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Command>,
    evict: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Creates a handle for connection `id` writing into `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Command>) -> Self {
        let (evict, _) = watch::channel(false);
        Self {
            id,
            tx,
            evict: Arc::new(evict),
        }
    }

    /// Returns the connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a command. Returns false if the connection is gone or was
    /// evicted because its queue is full.
    pub fn send(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!(
                    connection = self.id,
                    command = command.name(),
                    "Outbound queue full, evicting client"
                );
                self.evict();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the connection to close.
    pub fn evict(&self) {
        self.evict.send_replace(true);
    }

    /// Returns true once the connection was asked to close.
    pub fn is_evicted(&self) -> bool {
        *self.evict.borrow()
    }

    /// Receiver that turns true when the connection is evicted.
    pub(crate) fn eviction(&self) -> watch::Receiver<bool> {
        self.evict.subscribe()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Registry value for one nickname.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Connection that owns the nickname.
    pub connection: ConnectionHandle,
    /// Peer IP of the accepted socket.
    pub ip: String,
    /// UDP port as announced in `REGISTER`.
    pub udp_port: String,
}

impl ClientEntry {
    /// Creates a new entry.
    pub fn new(connection: ConnectionHandle, ip: impl Into<String>, udp_port: impl Into<String>) -> Self {
        Self {
            connection,
            ip: ip.into(),
            udp_port: udp_port.into(),
        }
    }

    fn user_entry(&self, nick: &str) -> UserEntry {
        UserEntry::new(nick, self.ip.clone(), self.udp_port.clone())
    }
}

#[derive(Debug)]
struct Slot {
    entry: ClientEntry,
    joined: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    clients: HashMap<String, Slot>,
    next_join: u64,
}

/// What a successful registration sees while the lock is still held.
#[derive(Debug)]
pub struct Admission<'a> {
    /// The entry just inserted.
    pub entry: &'a ClientEntry,
    /// Every registered client, the new one included, in join order.
    pub roster: Vec<UserEntry>,
    /// Outbound handles of everyone else.
    pub others: Vec<ConnectionHandle>,
}

impl RegistryInner {
    fn others(&self, connection: ConnectionId) -> Vec<ConnectionHandle> {
        self.clients
            .values()
            .filter(|slot| slot.entry.connection.id() != connection)
            .map(|slot| slot.entry.connection.clone())
            .collect()
    }

    fn roster(&self) -> Vec<UserEntry> {
        let mut slots: Vec<(&String, &Slot)> = self.clients.iter().collect();
        slots.sort_by_key(|(_, slot)| slot.joined);
        slots
            .into_iter()
            .map(|(nick, slot)| slot.entry.user_entry(nick))
            .collect()
    }
}

/// Nickname directory owned by one relay server instance.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `entry` under `nick` iff the nickname is free.
    ///
    /// Returns whether the insertion happened. Empty nicknames are refused.
    pub async fn try_register(&self, nick: &str, entry: ClientEntry) -> bool {
        self.try_register_with(nick, entry, |_| {}).await
    }

    /// Like [`Registry::try_register`], but on success runs `on_insert` while
    /// still holding the lock.
    ///
    /// `on_insert` must not block; it is meant for queueing the greeting and
    /// the join notice so they are ordered against every other registry
    /// change.
    pub async fn try_register_with<F>(&self, nick: &str, entry: ClientEntry, on_insert: F) -> bool
    where
        F: FnOnce(Admission<'_>),
    {
        if nick.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock().await;
        if inner.clients.contains_key(nick) {
            debug!(nick, "Nickname already registered");
            return false;
        }

        let joined = inner.next_join;
        inner.next_join += 1;
        inner.clients.insert(
            nick.to_string(),
            Slot {
                entry: entry.clone(),
                joined,
            },
        );

        on_insert(Admission {
            entry: &entry,
            roster: inner.roster(),
            others: inner.others(entry.connection.id()),
        });
        true
    }

    /// Removes `nick` only if it is still owned by `connection`.
    pub async fn remove_if_owner(&self, nick: &str, connection: ConnectionId) -> bool {
        self.remove_if_owner_with(nick, connection, |_| {}).await
    }

    /// Like [`Registry::remove_if_owner`], but on removal runs `on_remove`
    /// with the remaining clients while still holding the lock.
    pub async fn remove_if_owner_with<F>(
        &self,
        nick: &str,
        connection: ConnectionId,
        on_remove: F,
    ) -> bool
    where
        F: FnOnce(Vec<ConnectionHandle>),
    {
        let mut inner = self.inner.lock().await;
        match inner.clients.get(nick) {
            Some(slot) if slot.entry.connection.id() == connection => {
                inner.clients.remove(nick);
                on_remove(inner.others(connection));
                true
            }
            Some(_) => {
                debug!(nick, connection, "Not removing entry owned by another connection");
                false
            }
            None => false,
        }
    }

    /// Copies the registered clients in insertion order.
    pub async fn snapshot(&self) -> Vec<UserEntry> {
        self.inner.lock().await.roster()
    }

    /// Copies the outbound handles of every client except `connection`.
    pub async fn recipients_except(&self, connection: ConnectionId) -> Vec<ConnectionHandle> {
        self.inner.lock().await.others(connection)
    }

    /// Returns true if `nick` is registered.
    pub async fn contains(&self, nick: &str) -> bool {
        self.inner.lock().await.clients.contains_key(nick)
    }

    /// Number of registered clients.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Returns true if nobody is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every entry, returning how many there were.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.clients.len();
        inner.clients.clear();
        count
    }
}
