//! Connected clients and fan-out of server messages.
//!
//! Each WebSocket session registers a [`Recipient`] for [`Outbound`] text and
//! gets a short client id back. Sends never wait on a slow client: messages go
//! into the session's mailbox and the session actor writes them to its socket.

use crate::intercom::protocol::ServerMessage;
use actix::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};
use uuid::Uuid;

pub type ClientId = String;

/// Serialized JSON ready to be written to a socket.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct Outbound(pub Arc<str>);

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ClientId, Recipient<Outbound>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Recipient<Outbound>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session and return its new id, unique among connected clients.
    pub fn register(&self, sender: Recipient<Outbound>) -> ClientId {
        let mut sessions = self.lock();
        loop {
            let id = new_client_id();
            if !sessions.contains_key(&id) {
                sessions.insert(id.clone(), sender);
                return id;
            }
        }
    }

    pub fn unregister(&self, client_id: &str) -> bool {
        self.lock().remove(client_id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send to one client. A client whose session is gone is removed.
    pub fn send_to(&self, client_id: &str, message: &ServerMessage) -> bool {
        let Some(sender) = self.lock().get(client_id).cloned() else {
            return false;
        };
        let Some(payload) = encode(message) else {
            return false;
        };

        if deliver(&sender, payload) {
            true
        } else {
            debug!(client_id, "Dropping unreachable client");
            self.unregister(client_id);
            false
        }
    }

    /// Send to every connected client and return how many were reached.
    ///
    /// Works on a snapshot so sessions may join or leave meanwhile; the ones
    /// found closed are removed afterwards.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let Some(payload) = encode(message) else {
            return 0;
        };

        let snapshot: Vec<(ClientId, Recipient<Outbound>)> = self
            .lock()
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in snapshot {
            if deliver(&sender, payload.clone()) {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.lock();
            for id in &closed {
                sessions.remove(id);
                debug!(client_id = %id, "Dropping unreachable client");
            }
        }

        delivered
    }
}

fn new_client_id() -> ClientId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            error!(error = %err, "Failed to serialize server message");
            None
        }
    }
}

fn deliver(sender: &Recipient<Outbound>, payload: Arc<str>) -> bool {
    match sender.try_send(Outbound(payload)) {
        Ok(()) => true,
        // mailbox at capacity: queue anyway rather than lose a state change
        Err(SendError::Full(message)) => {
            sender.do_send(message);
            true
        }
        Err(SendError::Closed(_)) => false,
    }
}
