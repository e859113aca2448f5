//! STAN-indexed correlation table for in-flight requests.
//!
//! The dual-channel architecture means a response arrives on a different
//! socket than its request left on; the only thing tying the two together
//! is the STAN in field 11. Every outbound request registers here before
//! its bytes leave the process, and every inbound message tries to
//! complete a registered entry. No match means the message is unsolicited
//! and belongs to the surrounding client's event layer, not to this table.
//!
//! Each entry owns a single-fire completion sink and its own timer task.
//! Exactly one of three terminal transitions wins (completed with a
//! response, cancelled with a cause, or expired at the deadline) and the
//! entry leaves the table in the same critical section that decides the
//! winner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::FepError;
use crate::iso::Message;

/// A waiter's half of a pending entry.
///
/// Awaiting it yields the terminal outcome of the entry: the matched
/// response, or the cancellation/expiry cause. Dropping it without
/// waiting counts as caller cancellation and removes the entry from the
/// table (a no-op when the entry already reached a terminal state).
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Message, FepError>>,
    table: PendingTable,
    stan: u32,
}

impl PendingReply {
    /// Wait for the entry's terminal transition.
    pub async fn wait(mut self) -> Result<Message, FepError> {
        // A dropped sender means the table itself went away mid-flight
        (&mut self.rx).await.unwrap_or(Err(FepError::ManagerClosed))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // Caller cancellation: reap the entry if nothing else did
        if let Some(entry) = self.table.take(self.stan) {
            entry.timer.abort();
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("stan", &self.stan).finish()
    }
}

struct Entry {
    tx: oneshot::Sender<Result<Message, FepError>>,
    timer: JoinHandle<()>,
}

struct Inner {
    entries: HashMap<u32, Entry>,
    closed: bool,
}

/// The pending-request table. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct PendingTable {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Register a STAN and arm its timeout.
    ///
    /// The entry exists before this returns, so a response racing the
    /// caller's subsequent write cannot slip past the table.
    ///
    /// # Errors
    ///
    /// `DuplicateStan` if the STAN is already in flight, `ManagerClosed`
    /// after [`close`](Self::close).
    pub fn register(&self, stan: u32, timeout: Duration) -> Result<PendingReply, FepError> {
        let (tx, rx) = oneshot::channel();

        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        if inner.closed {
            return Err(FepError::ManagerClosed);
        }
        if inner.entries.contains_key(&stan) {
            return Err(FepError::DuplicateStan(format!("{stan:06}")));
        }

        let table = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(stan);
        });

        inner.entries.insert(stan, Entry { tx, timer });
        Ok(PendingReply {
            rx,
            table: self.clone(),
            stan,
        })
    }

    /// Fulfil a STAN with its response.
    ///
    /// Returns `false` when the STAN is not in flight: a late response
    /// after expiry, or a server-initiated message; the caller routes
    /// those to the unsolicited path.
    pub fn complete(&self, stan: u32, response: Message) -> bool {
        match self.take(stan) {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail a single STAN with a cause. No-op when absent.
    pub fn cancel(&self, stan: u32, cause: FepError) -> bool {
        match self.take(stan) {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(Err(cause));
                true
            }
            None => false,
        }
    }

    /// Fail every in-flight entry with the same cause.
    ///
    /// Used on fatal channel loss: each waiter observes the cause exactly
    /// once, and the table is empty afterwards.
    pub fn cancel_all(&self, cause: FepError) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock().expect("pending table lock poisoned");
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(cause.clone()));
        }
        count
    }

    /// Cancel everything with `cause` and refuse all further registrations.
    pub fn close(&self, cause: FepError) {
        {
            let mut inner = self.inner.lock().expect("pending table lock poisoned");
            inner.closed = true;
        }
        self.cancel_all(cause);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("pending table lock poisoned").closed
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table lock poisoned").entries.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a STAN is currently in flight.
    pub fn contains(&self, stan: u32) -> bool {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .entries
            .contains_key(&stan)
    }

    /// Remove an entry under the lock; whoever gets `Some` owns the only
    /// terminal transition.
    fn take(&self, stan: u32) -> Option<Entry> {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .entries
            .remove(&stan)
    }

    /// Timer path: expire an entry with `Timeout` if it still exists.
    fn expire(&self, stan: u32) {
        if let Some(entry) = self.take(stan) {
            log::debug!("[Pending] STAN {stan:06} expired");
            let _ = entry.tx.send(Err(FepError::Timeout));
        }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("in_flight", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelSide;
    use crate::iso::Mti;

    fn response(stan: u32) -> Message {
        let mut msg = Message::new(Mti::NETWORK_MANAGEMENT_RESPONSE);
        msg.set_stan(stan).set_response_code("00");
        msg
    }

    #[tokio::test]
    async fn test_register_then_complete() {
        let table = PendingTable::new();
        let reply = table.register(1, Duration::from_secs(5)).unwrap();

        assert!(table.complete(1, response(1)));
        let msg = reply.wait().await.unwrap();
        assert_eq!(msg.stan(), Some("000001"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_stan_rejected() {
        let table = PendingTable::new();
        let _reply = table.register(7, Duration::from_secs(5)).unwrap();
        match table.register(7, Duration::from_secs(5)) {
            Err(FepError::DuplicateStan(s)) => assert_eq!(s, "000007"),
            other => panic!("Expected DuplicateStan, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_entry_expires_with_timeout() {
        let table = PendingTable::new();
        let reply = table.register(2, Duration::from_millis(50)).unwrap();
        match reply.wait().await {
            Err(FepError::Timeout) => {}
            other => panic!("Expected Timeout, got: {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_late_complete_reports_unmatched() {
        let table = PendingTable::new();
        let reply = table.register(3, Duration::from_millis(30)).unwrap();
        let _ = reply.wait().await; // let it expire
        assert!(!table.complete(3, response(3)), "late response must not match");
    }

    #[tokio::test]
    async fn test_cancel_single() {
        let table = PendingTable::new();
        let reply = table.register(4, Duration::from_secs(5)).unwrap();
        assert!(table.cancel(4, FepError::ChannelClosed(ChannelSide::Send)));
        match reply.wait().await {
            Err(FepError::ChannelClosed(ChannelSide::Send)) => {}
            other => panic!("Expected ChannelClosed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_all_fans_out_once() {
        let table = PendingTable::new();
        let replies: Vec<_> = (0..5)
            .map(|stan| table.register(stan, Duration::from_secs(5)).unwrap())
            .collect();

        let cancelled = table.cancel_all(FepError::ChannelClosed(ChannelSide::Receive));
        assert_eq!(cancelled, 5);
        assert!(table.is_empty());

        for reply in replies {
            match reply.wait().await {
                Err(FepError::ChannelClosed(ChannelSide::Receive)) => {}
                other => panic!("Expected ChannelClosed, got: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_refuses_registration() {
        let table = PendingTable::new();
        let reply = table.register(9, Duration::from_secs(5)).unwrap();
        table.close(FepError::ChannelClosed(ChannelSide::Unified));

        match reply.wait().await {
            Err(FepError::ChannelClosed(_)) => {}
            other => panic!("Expected ChannelClosed, got: {other:?}"),
        }
        match table.register(10, Duration::from_secs(5)) {
            Err(FepError::ManagerClosed) => {}
            other => panic!("Expected ManagerClosed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_and_expiry_race_single_winner() {
        // Deadline set to land right on top of the completion; whichever
        // side takes the entry first must be the only observable outcome.
        for _ in 0..20 {
            let table = PendingTable::new();
            let reply = table.register(5, Duration::from_millis(5)).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let matched = table.complete(5, response(5));
            match reply.wait().await {
                Ok(msg) => {
                    assert!(matched, "completion observed but complete() reported miss");
                    assert_eq!(msg.stan(), Some("000005"));
                }
                Err(FepError::Timeout) => {
                    assert!(!matched, "timeout observed but complete() reported match");
                }
                other => panic!("Expected response or Timeout, got: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dropping_reply_removes_entry() {
        let table = PendingTable::new();
        let reply = table.register(6, Duration::from_secs(5)).unwrap();
        assert_eq!(table.len(), 1);

        drop(reply);
        assert!(table.is_empty(), "caller cancellation must reap the entry");
        // Idempotent with the other terminal paths
        assert!(!table.complete(6, response(6)));
        assert!(!table.cancel(6, FepError::Timeout));
    }

    #[tokio::test]
    async fn test_concurrent_registration_distinct_stans() {
        let table = PendingTable::new();
        let mut handles = Vec::new();
        for stan in 0..50u32 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.register(stan, Duration::from_secs(5)).unwrap()
            }));
        }
        let mut replies = Vec::new();
        for handle in handles {
            replies.push(handle.await.unwrap());
        }
        assert_eq!(table.len(), 50);
    }
}
