//! # Tunnel Session
//!
//! A session binds one route to at most one attached connection. It owns
//! the per-session correlation table and the outbound send discipline:
//! every frame leaves through the connection's queue, drained by a single
//! writer task, so frames appear on the wire in hand-off order.
//!
//! Sessions cycle between detached and attached many times over their
//! life. Attaching over a live connection supersedes it: the previous
//! connection is told to close and its pending requests fail with
//! `Superseded` before the new connection takes the slot.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::TunnelError;
use crate::pending::PendingTable;
use crate::protocol::{mint_id, now_ts, Frame, RequestPayload, ResponseFrame};

/// Commands consumed by a connection's writer task. The writer is the only
/// code that touches the WebSocket sink.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and send a protocol frame.
    Frame(Frame),
    /// Send a close frame with the given code and reason, then stop.
    Close { code: u16, reason: String },
}

/// Handle to an attached connection: an id for staleness checks and the
/// sender feeding the writer task.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    pub fn new(id: Uuid, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queues a frame for the writer task. Fails once the writer is gone.
    pub fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TunnelError::TransportError)
    }

    /// Tells the writer task to close the socket and stop.
    pub fn close(&self, code: u16, reason: String) {
        let _ = self.tx.send(Outbound::Close { code, reason });
    }
}

/// Runtime binding of a route to a tunnel connection.
#[derive(Debug)]
pub struct Session {
    route: String,
    token: String,
    description: Option<String>,
    created_at: f64,
    last_seen: Mutex<Option<f64>>,
    conn: Mutex<Option<ConnHandle>>,
    pending: PendingTable,
}

/// Removes the pending slot when a `send_request` future is dropped before
/// resolution, so a cancelled ingress caller frees its slot promptly and a
/// late response finds nothing to deliver to.
struct SlotGuard<'a> {
    pending: &'a PendingTable,
    cid: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.cid, TunnelError::Disconnected);
    }
}

impl Session {
    pub fn new(route: String, token: String, description: Option<String>) -> Self {
        Self {
            route,
            token,
            description,
            created_at: now_ts(),
            last_seen: Mutex::new(None),
            conn: Mutex::new(None),
            pending: PendingTable::new(),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn last_seen(&self) -> Option<f64> {
        *self.last_seen.lock().expect("last_seen lock")
    }

    pub fn connected(&self) -> bool {
        self.conn.lock().expect("conn lock").is_some()
    }

    /// True iff `conn_id` is the currently attached connection.
    pub fn is_current(&self, conn_id: Uuid) -> bool {
        self.conn
            .lock()
            .expect("conn lock")
            .as_ref()
            .map(|c| c.id() == conn_id)
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sweeps pending entries whose deadline has passed, failing each with
    /// `Timeout`.
    pub fn expire_due(&self, now: Instant) {
        self.pending.expire_due(now);
    }

    /// Marks inbound activity. `last_seen` never moves backwards, even if
    /// the wall clock does.
    pub fn touch(&self) {
        let now = now_ts();
        let mut last_seen = self.last_seen.lock().expect("last_seen lock");
        *last_seen = Some(last_seen.map_or(now, |prev| prev.max(now)));
    }

    /// Binds `conn` to this session. A previously attached connection is
    /// closed and its pending requests fail with `Superseded`, so a
    /// reconnecting client after an undetected partition is never locked
    /// out.
    pub fn attach(&self, conn: ConnHandle) {
        // The old connection is closed and its pending requests fail
        // before the new connection takes the slot, so requests started
        // on the new connection can never be voided as superseded.
        let previous = self.conn.lock().expect("conn lock").take();
        if let Some(old) = previous {
            debug!(route = %self.route, old_conn = %old.id(), "connection superseded");
            old.close(1000, TunnelError::Superseded.to_string());
            self.pending.drain(TunnelError::Superseded);
        }
        self.conn.lock().expect("conn lock").replace(conn);
        self.touch();
    }

    /// Detaches `conn_id` if it is still the current connection; stale ids
    /// are ignored so a superseded connection's cleanup cannot tear down
    /// its replacement. Returns whether a detach happened.
    pub fn detach(&self, conn_id: Uuid) -> bool {
        let removed = {
            let mut conn = self.conn.lock().expect("conn lock");
            let is_current = conn.as_ref().map(|c| c.id() == conn_id).unwrap_or(false);
            if is_current {
                conn.take()
            } else {
                None
            }
        };
        match removed {
            Some(_) => {
                self.pending.drain(TunnelError::Disconnected);
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Closes any attached connection and drains pending requests with
    /// `reason`. Terminal for route deletion, also used when a ping write
    /// fails.
    pub fn close(&self, reason: TunnelError) {
        let removed = self.conn.lock().expect("conn lock").take();
        if let Some(conn) = removed {
            conn.close(1000, reason.to_string());
        }
        self.pending.drain(reason);
        self.touch();
    }

    /// Queues a frame on the attached connection.
    pub fn send_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        let conn = self
            .conn
            .lock()
            .expect("conn lock")
            .clone()
            .ok_or(TunnelError::NotConnected)?;
        conn.send(frame)
    }

    /// Forwards one ingress request and awaits its response.
    ///
    /// Mints a fresh correlation id, registers the pending slot with
    /// `deadline = now + timeout`, queues the encoded `request` frame, and
    /// awaits the sink. The slot is removed on every exit path: response
    /// delivery, timeout, write failure, drain, or caller cancellation.
    pub async fn send_request(
        &self,
        payload: RequestPayload,
        timeout: Duration,
    ) -> Result<ResponseFrame, TunnelError> {
        let conn = self
            .conn
            .lock()
            .expect("conn lock")
            .clone()
            .ok_or(TunnelError::NotConnected)?;

        let deadline = Instant::now() + timeout;
        let (cid, rx) = loop {
            let cid = mint_id();
            match self.pending.insert(&cid, deadline) {
                Ok(rx) => break (cid, rx),
                Err(TunnelError::DuplicateCorrelation) => continue,
                Err(other) => return Err(other),
            }
        };
        let guard = SlotGuard {
            pending: &self.pending,
            cid: &cid,
        };

        let frame = Frame::Request(payload.into_frame(cid.clone()));
        if conn.send(frame).is_err() {
            drop(guard);
            return Err(TunnelError::TransportError);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                std::mem::forget(guard);
                result
            }
            Ok(Err(_closed)) => {
                std::mem::forget(guard);
                Err(TunnelError::Disconnected)
            }
            Err(_elapsed) => {
                self.pending.cancel(&cid, TunnelError::Timeout);
                std::mem::forget(guard);
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Handles one decoded frame from the attached client. Any inbound
    /// frame refreshes `last_seen`; `response` frames resolve their pending
    /// slot, everything else carries no session-level action.
    pub fn on_frame(&self, frame: Frame) {
        self.touch();
        match frame {
            Frame::Response(resp) => {
                let cid = resp.correlation_id.clone();
                self.pending.complete(&cid, resp);
            }
            Frame::Pong { .. } => {}
            // The server is the sole ping initiator; an inbound ping is
            // consumed without a reply. Clients never originate requests.
            Frame::Ping { .. } | Frame::Request(_) => {}
        }
    }
}
