//! Institution-id routing table for the dual-port server.
//!
//! Each FEP talks to the server over two sockets: the receiving half (the
//! server reads its requests there) and the sending half (the server
//! writes its responses there). Both halves announce the same institution
//! id in field 32 of their first message; this table pairs them so a
//! response for institution "001" lands on client 001's sending half and
//! nobody else's.
//!
//! An entry stays alive while at least one half is connected; lookup is
//! plain string equality on the institution id.

use std::collections::HashMap;
use std::sync::Mutex;

use super::conn::ConnId;

/// The two halves registered for one institution.
#[derive(Debug, Clone, Copy, Default)]
struct Pair {
    receiving: Option<ConnId>,
    sending: Option<ConnId>,
}

impl Pair {
    fn is_empty(&self) -> bool {
        self.receiving.is_none() && self.sending.is_none()
    }
}

/// institution id → socket pair.
#[derive(Debug, Default)]
pub(crate) struct ClientRouter {
    entries: Mutex<HashMap<String, Pair>>,
}

impl ClientRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the socket the server reads this institution's requests from.
    pub(crate) fn register_receiving(&self, institution: &str, conn_id: ConnId) {
        let mut entries = self.entries.lock().expect("router lock poisoned");
        let pair = entries.entry(institution.to_string()).or_default();
        if pair.receiving != Some(conn_id) {
            log::info!("[Server] institution {institution}: receiving half is conn #{conn_id}");
            pair.receiving = Some(conn_id);
        }
    }

    /// Record the socket the server writes this institution's responses to.
    pub(crate) fn register_sending(&self, institution: &str, conn_id: ConnId) {
        let mut entries = self.entries.lock().expect("router lock poisoned");
        let pair = entries.entry(institution.to_string()).or_default();
        if pair.sending != Some(conn_id) {
            log::info!("[Server] institution {institution}: sending half is conn #{conn_id}");
            pair.sending = Some(conn_id);
        }
    }

    /// The sending half for an institution, if one has announced itself.
    pub(crate) fn sending_conn(&self, institution: &str) -> Option<ConnId> {
        self.entries
            .lock()
            .expect("router lock poisoned")
            .get(institution)
            .and_then(|pair| pair.sending)
    }

    /// Drop a disconnected socket from whatever halves it occupied. An
    /// institution whose last half disappears loses its entry entirely.
    pub(crate) fn forget_conn(&self, conn_id: ConnId) {
        let mut entries = self.entries.lock().expect("router lock poisoned");
        for (institution, pair) in entries.iter_mut() {
            if pair.receiving == Some(conn_id) {
                log::info!("[Server] institution {institution}: receiving half gone");
                pair.receiving = None;
            }
            if pair.sending == Some(conn_id) {
                log::info!("[Server] institution {institution}: sending half gone");
                pair.sending = None;
            }
        }
        entries.retain(|_, pair| !pair.is_empty());
    }

    /// Institutions currently known.
    pub(crate) fn institutions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .expect("router lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("router lock poisoned").len()
    }
}
