//! Relay session: one accepted connection paired with one outbound connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::ForwardError;
use crate::notification::Notification;
use crate::transmission::{Direction, Transmission};

/// Releases a session's slot on the engine however the session ends.
///
/// Dropping it closes the transmission, decrements the engine's current
/// connection count and publishes the end-of-transmission notification,
/// exactly once, including when the session task panics.
pub(crate) struct ConnectionGuard {
    shared: Arc<Shared>,
    transmission: Arc<Transmission>,
}

impl ConnectionGuard {
    pub(crate) fn new(shared: Arc<Shared>, transmission: Arc<Transmission>) -> Self {
        Self {
            shared,
            transmission,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.transmission.close(std::thread::panicking());
        self.shared.connection_closed();
        self.shared.publish(Notification::ended(&self.transmission));
    }
}

/// Why the copy loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    ClientClosed,
    RemoteClosed,
    Stopped,
    PeerLost,
}

pub(crate) struct RelaySession {
    shared: Arc<Shared>,
    transmission: Arc<Transmission>,
    stop_rx: watch::Receiver<bool>,
    _guard: ConnectionGuard,
}

impl RelaySession {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transmission: Arc<Transmission>,
        stop_rx: watch::Receiver<bool>,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            shared,
            transmission,
            stop_rx,
            _guard: guard,
        }
    }

    /// Connect to the remote and relay until either side closes or the
    /// activation that accepted the client is stopped.
    pub(crate) async fn run(self, mut client: TcpStream) {
        let id = self.transmission.id();
        let source = self.transmission.source();
        let remote = self.transmission.destination();
        self.shared.publish(Notification::started(&self.transmission));
        info!(%id, %source, %remote, "Transmission started");

        let upstream = match self.connect(remote).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%id, error = %err, "Outbound connect failed");
                self.transmission.close(true);
                self.shared.publish(Notification::error(err));
                let _ = client.shutdown().await;
                return;
            }
        };
        self.transmission.mark_relaying();

        match self.relay(client, upstream).await {
            Ok(finish) => {
                self.transmission.close(false);
                info!(
                    %id,
                    ?finish,
                    uploaded = self.transmission.uploaded_bytes(),
                    downloaded = self.transmission.downloaded_bytes(),
                    "Transmission ended"
                );
            }
            Err(err) => {
                self.transmission.close(true);
                warn!(%id, error = %err, "Transmission failed");
                self.shared.publish(Notification::error(err));
            }
        }
    }

    async fn connect(&self, remote: SocketAddr) -> Result<TcpStream, ForwardError> {
        match timeout(self.shared.config.connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ForwardError::connect(remote, e)),
            Err(_) => Err(ForwardError::connect(
                remote,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            )),
        }
    }

    /// Copy both directions concurrently. The first direction to finish, or
    /// the liveness check, ends the session; both write sides are then shut.
    async fn relay(&self, client: TcpStream, upstream: TcpStream) -> Result<Finish, ForwardError> {
        let (client_rd, mut client_wr) = client.into_split();
        let (upstream_rd, mut upstream_wr) = upstream.into_split();

        let outcome = tokio::select! {
            res = self.pump(&client_rd, &mut upstream_wr, Direction::Upload) => res,
            res = self.pump(&upstream_rd, &mut client_wr, Direction::Download) => res,
            finish = self.watch_liveness(&client_rd, &upstream_rd) => Ok(finish),
        };

        let _ = client_wr.shutdown().await;
        let _ = upstream_wr.shutdown().await;
        outcome
    }

    /// Forward whatever is readable on `reader` to `writer`, one chunk at a
    /// time. Chunks are recorded as soon as they are read, so the record keeps
    /// the order in which this session observed the traffic.
    async fn pump(
        &self,
        reader: &OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        direction: Direction,
    ) -> Result<Finish, ForwardError> {
        let (from, to, closed) = match direction {
            Direction::Upload => (
                self.transmission.source(),
                self.transmission.destination(),
                Finish::ClientClosed,
            ),
            Direction::Download => (
                self.transmission.destination(),
                self.transmission.source(),
                Finish::RemoteClosed,
            ),
        };
        let mut buf = vec![0u8; self.shared.config.read_buffer_size];

        loop {
            reader
                .readable()
                .await
                .map_err(|e| ForwardError::transport(from, e))?;
            let n = match reader.try_read(&mut buf) {
                Ok(0) => return Ok(closed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ForwardError::transport(from, e)),
            };
            let chunk = &buf[..n];
            match direction {
                Direction::Upload => self.transmission.add_upload(chunk),
                Direction::Download => self.transmission.add_download(chunk),
            }
            writer
                .write_all(chunk)
                .await
                .map_err(|e| ForwardError::transport(to, e))?;
            self.shared.publish(match direction {
                Direction::Upload => Notification::sent(&self.transmission, n),
                Direction::Download => Notification::received(&self.transmission, n),
            });
        }
    }

    /// Resolves once the activation is stopped or either socket reports a
    /// pending error. Runs independently of the pumps, so a write stuck on a
    /// peer that stopped reading does not delay it.
    async fn watch_liveness(&self, client: &OwnedReadHalf, upstream: &OwnedReadHalf) -> Finish {
        let mut liveness = tokio::time::interval(self.shared.config.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        loop {
            liveness.tick().await;
            if stop_requested(&self.stop_rx) {
                return Finish::Stopped;
            }
            if !is_alive(client.as_ref()) || !is_alive(upstream.as_ref()) {
                debug!(id = %self.transmission.id(), "Peer lost");
                return Finish::PeerLost;
            }
        }
    }
}

/// The activation was stopped, or its engine dropped without stopping it.
fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    let stopped = *stop_rx.borrow();
    stopped || stop_rx.has_changed().is_err()
}

/// A socket with a pending error (reset, unreachable) is dead.
fn is_alive(stream: &TcpStream) -> bool {
    matches!(stream.take_error(), Ok(None))
}
