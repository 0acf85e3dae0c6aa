//! Per-connection traffic log.
//!
//! A [`Transmission`] is created when a connection is accepted and appended to
//! only by the relay session that owns it. Once the session closes it, the
//! record no longer changes and can be read from any task.

use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Which way a chunk travelled, seen from the listener's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to remote.
    Upload,
    /// Remote to client.
    Download,
}

/// One forwarded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

/// Lifecycle of the relay session behind a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closed { failed: bool },
}

impl SessionState {
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[derive(Debug)]
struct Log {
    state: SessionState,
    uploaded: u64,
    downloaded: u64,
    events: Vec<MessageEvent>,
    ended_at: Option<SystemTime>,
}

/// Metadata and ordered conversation of one relayed connection.
#[derive(Debug)]
pub struct Transmission {
    id: Uuid,
    source: SocketAddr,
    destination: SocketAddr,
    started_at: SystemTime,
    log: RwLock<Log>,
}

impl Transmission {
    pub(crate) fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            started_at: SystemTime::now(),
            log: RwLock::new(Log {
                state: SessionState::Connecting,
                uploaded: 0,
                downloaded: 0,
                events: Vec::new(),
                ended_at: None,
            }),
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the client that connected to the listener.
    pub const fn source(&self) -> SocketAddr {
        self.source
    }

    /// Remote endpoint the connection was forwarded to.
    pub const fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub const fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<SystemTime> {
        self.read().ended_at
    }

    /// Time from start to close, or to now while still open.
    pub fn duration(&self) -> Duration {
        let end = self.ended_at().unwrap_or_else(SystemTime::now);
        end.duration_since(self.started_at).unwrap_or_default()
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.read().uploaded
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.read().downloaded
    }

    /// Copy of the conversation so far, in the order it happened.
    pub fn events(&self) -> Vec<MessageEvent> {
        self.read().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }

    pub(crate) fn add_upload(&self, payload: &[u8]) {
        self.append(Direction::Upload, payload);
    }

    pub(crate) fn add_download(&self, payload: &[u8]) {
        self.append(Direction::Download, payload);
    }

    pub(crate) fn mark_relaying(&self) {
        let mut log = self.write();
        if log.state == SessionState::Connecting {
            log.state = SessionState::Relaying;
        }
    }

    /// Close the record. Only the first call has any effect.
    pub(crate) fn close(&self, failed: bool) {
        let mut log = self.write();
        if log.state.is_closed() {
            return;
        }
        log.state = SessionState::Closed { failed };
        let now = SystemTime::now().max(self.started_at);
        log.ended_at = Some(log.events.last().map_or(now, |e| now.max(e.timestamp)));
    }

    fn append(&self, direction: Direction, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut log = self.write();
        if log.state.is_closed() {
            return;
        }
        // Wall clock may step backwards; the timeline must not.
        let floor = log.events.last().map_or(self.started_at, |e| e.timestamp);
        let timestamp = SystemTime::now().max(floor);
        let len = payload.len() as u64;
        match direction {
            Direction::Upload => log.uploaded += len,
            Direction::Download => log.downloaded += len,
        }
        log.events.push(MessageEvent {
            timestamp,
            direction,
            payload: payload.to_vec(),
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, Log> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Log> {
        self.log.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Transmission {
        Transmission::new(
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:33211".parse().unwrap(),
        )
    }

    #[test]
    fn byte_totals_match_events() {
        let t = record();
        t.add_upload(b"ping");
        t.add_download(b"pong!");
        t.add_upload(b"x");

        let events = t.events();
        let sum = |dir| {
            events
                .iter()
                .filter(|e| e.direction == dir)
                .map(|e| e.payload.len() as u64)
                .sum::<u64>()
        };
        assert_eq!(t.uploaded_bytes(), 5);
        assert_eq!(t.downloaded_bytes(), 5);
        assert_eq!(sum(Direction::Upload), t.uploaded_bytes());
        assert_eq!(sum(Direction::Download), t.downloaded_bytes());
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let t = record();
        t.add_upload(b"");
        t.add_download(&[]);
        assert_eq!(t.event_count(), 0);
    }

    #[test]
    fn closed_record_is_frozen() {
        let t = record();
        t.mark_relaying();
        t.add_upload(b"before");
        t.close(true);
        t.add_upload(b"after");
        t.close(false);
        t.mark_relaying();

        assert_eq!(t.state(), SessionState::Closed { failed: true });
        assert_eq!(t.uploaded_bytes(), 6);
        assert_eq!(t.event_count(), 1);
        assert!(t.ended_at().is_some());
    }

    #[test]
    fn state_moves_forward_only() {
        let t = record();
        assert_eq!(t.state(), SessionState::Connecting);
        t.mark_relaying();
        assert_eq!(t.state(), SessionState::Relaying);
        t.close(false);
        assert!(t.state().is_closed());
    }
}
