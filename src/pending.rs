//! # Correlation Table
//!
//! Per-session map from correlation id to a one-shot response sink with a
//! deadline. The session's receive loop completes entries as `response`
//! frames arrive; timeouts, detaches, and deletions fail them.
//!
//! Removal transfers ownership of the sink, so every entry resolves exactly
//! once no matter how `complete`, `cancel`, and `expire_due` race.

use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::TunnelError;
use crate::protocol::ResponseFrame;

/// The value delivered to an awaiting ingress caller.
pub type PendingResult = Result<ResponseFrame, TunnelError>;

/// Receiver half handed back to the caller of [`PendingTable::insert`].
pub type PendingReceiver = oneshot::Receiver<PendingResult>;

#[derive(Debug)]
struct PendingEntry {
    sink: oneshot::Sender<PendingResult>,
    deadline: Instant,
    created: Instant,
}

/// Correlation-id keyed table of in-flight requests for one session.
#[derive(Default, Debug)]
pub struct PendingTable {
    slots: DashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending slot for `cid` and returns the receiver to await.
    ///
    /// Fails with [`TunnelError::DuplicateCorrelation`] if the id is already
    /// present.
    pub fn insert(&self, cid: &str, deadline: Instant) -> Result<PendingReceiver, TunnelError> {
        match self.slots.entry(cid.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateCorrelation),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingEntry {
                    sink: tx,
                    deadline,
                    created: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Delivers `response` to the sink for `cid`. No-op when the id is
    /// absent, so late responses for timed-out or cancelled requests are
    /// dropped silently.
    pub fn complete(&self, cid: &str, response: ResponseFrame) {
        if let Some((_, entry)) = self.slots.remove(cid) {
            let _ = entry.sink.send(Ok(response));
        }
    }

    /// Fails the sink for `cid` with `reason`. No-op when absent.
    pub fn cancel(&self, cid: &str, reason: TunnelError) {
        if let Some((_, entry)) = self.slots.remove(cid) {
            let _ = entry.sink.send(Err(reason));
        }
    }

    /// Removes and fails every entry whose deadline is at or before `now`,
    /// reporting [`TunnelError::Timeout`] to each.
    pub fn expire_due(&self, now: Instant) {
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for cid in due {
            if let Some((_, entry)) = self.slots.remove(&cid) {
                debug!(
                    cid = %cid,
                    age_secs = entry.created.elapsed().as_secs_f64(),
                    "pending request expired"
                );
                let _ = entry.sink.send(Err(TunnelError::Timeout));
            }
        }
    }

    /// Removes and fails every entry with `reason`. Used on detach,
    /// supersede, and route deletion.
    pub fn drain(&self, reason: TunnelError) {
        let cids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        for cid in cids {
            if let Some((_, entry)) = self.slots.remove(&cid) {
                let _ = entry.sink.send(Err(reason.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn response(cid: &str) -> ResponseFrame {
        ResponseFrame {
            correlation_id: cid.to_string(),
            status_code: 200,
            headers: HashMap::new(),
            body_b64: None,
        }
    }

    #[tokio::test]
    async fn complete_delivers_to_sink() {
        let table = PendingTable::new();
        let rx = table.insert("c1", Instant::now() + Duration::from_secs(5)).unwrap();
        table.complete("c1", response("c1"));
        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.correlation_id, "c1");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let table = PendingTable::new();
        let _rx = table.insert("c1", Instant::now() + Duration::from_secs(5)).unwrap();
        let err = table
            .insert("c1", Instant::now() + Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, TunnelError::DuplicateCorrelation);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn cancel_reports_reason() {
        let table = PendingTable::new();
        let rx = table.insert("c1", Instant::now() + Duration::from_secs(5)).unwrap();
        table.cancel("c1", TunnelError::Disconnected);
        assert_eq!(rx.await.unwrap().unwrap_err(), TunnelError::Disconnected);
    }

    #[tokio::test]
    async fn complete_after_cancel_is_noop() {
        let table = PendingTable::new();
        let rx = table.insert("c1", Instant::now() + Duration::from_secs(5)).unwrap();
        table.cancel("c1", TunnelError::Superseded);
        table.complete("c1", response("c1"));
        assert_eq!(rx.await.unwrap().unwrap_err(), TunnelError::Superseded);
    }

    #[tokio::test]
    async fn complete_of_absent_cid_is_noop() {
        let table = PendingTable::new();
        table.complete("ghost", response("ghost"));
        table.cancel("ghost", TunnelError::Disconnected);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn expire_due_fails_only_due_entries() {
        let table = PendingTable::new();
        let now = Instant::now();
        let rx_due = table.insert("due", now).unwrap();
        let rx_live = table.insert("live", now + Duration::from_secs(60)).unwrap();

        table.expire_due(now);

        assert_eq!(rx_due.await.unwrap().unwrap_err(), TunnelError::Timeout);
        assert_eq!(table.len(), 1);

        table.complete("live", response("live"));
        assert!(rx_live.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn drain_fails_everything() {
        let table = PendingTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let receivers: Vec<_> = (0..4)
            .map(|i| table.insert(&format!("c{i}"), deadline).unwrap())
            .collect();

        table.drain(TunnelError::Disconnected);
        assert!(table.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap_err(), TunnelError::Disconnected);
        }
    }
}
