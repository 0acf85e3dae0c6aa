//! Listener engine: one forward from a local endpoint to a remote endpoint.
//!
//! [`Forwarder`] owns the listening socket and the accept loop, counts
//! connections, keeps a bounded history of transmissions and publishes
//! every lifecycle change on its [`EventBus`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::endpoint;
use crate::error::ForwardError;
use crate::notification::{EventBus, Notification};
use crate::session::{ConnectionGuard, RelaySession};
use crate::transmission::Transmission;

/// Pause after a failed `accept` so a persistent error can't spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One activation of the listener.
struct Run {
    stop_tx: watch::Sender<bool>,
    /// Taken by `deactivate` while it waits for the loop to exit.
    accept_task: Option<JoinHandle<()>>,
    bound: SocketAddr,
}

#[derive(Default)]
struct EngineState {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    current_connections: usize,
    total_connections: u64,
    run: Option<Run>,
}

/// State shared between the engine handle, its accept loop and its sessions.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    bus: EventBus,
    state: Mutex<EngineState>,
    history: Mutex<VecDeque<Arc<Transmission>>>,
    idle: Notify,
}

impl Shared {
    pub(crate) fn publish(&self, notification: Notification) {
        self.bus.publish(notification);
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<Arc<Transmission>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_opened(&self) {
        let mut state = self.state();
        state.current_connections += 1;
        state.total_connections += 1;
    }

    pub(crate) fn connection_closed(&self) {
        let now_idle = {
            let mut state = self.state();
            state.current_connections = state.current_connections.saturating_sub(1);
            state.current_connections == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    fn remember(&self, transmission: &Arc<Transmission>) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.history();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(Arc::clone(transmission));
    }
}

/// A single port forward.
///
/// Created idle. Endpoints can only be changed while idle; [`activate`]
/// starts listening and [`deactivate`] stops accepting new connections.
/// Sessions accepted by an activation end on their own once that activation
/// is stopped.
///
/// [`activate`]: Forwarder::activate
/// [`deactivate`]: Forwarder::deactivate
pub struct Forwarder {
    shared: Arc<Shared>,
    /// Held for the whole of `activate` and `deactivate`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Forwarder {
    pub fn new(config: EngineConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                state: Mutex::new(EngineState::default()),
                history: Mutex::new(VecDeque::new()),
                idle: Notify::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolve and set the listening endpoint.
    pub async fn set_local(&self, host: &str, port: u16) -> Result<SocketAddr, ForwardError> {
        self.ensure_idle()?;
        let addr = endpoint::resolve(host, port).await?;
        self.set_local_addr(addr)?;
        Ok(addr)
    }

    /// Resolve and set the remote endpoint.
    pub async fn set_remote(&self, host: &str, port: u16) -> Result<SocketAddr, ForwardError> {
        self.ensure_idle()?;
        let addr = endpoint::resolve(host, port).await?;
        self.set_remote_addr(addr)?;
        Ok(addr)
    }

    pub fn set_local_addr(&self, addr: SocketAddr) -> Result<(), ForwardError> {
        let _lifecycle = self.lifecycle.try_lock().map_err(|_| {
            ForwardError::InvalidState("can't set local endpoint while starting or stopping")
        })?;
        let mut state = self.shared.state();
        if state.run.is_some() {
            return Err(ForwardError::InvalidState("can't set local endpoint while active"));
        }
        state.local = Some(addr);
        Ok(())
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) -> Result<(), ForwardError> {
        let _lifecycle = self.lifecycle.try_lock().map_err(|_| {
            ForwardError::InvalidState("can't set remote endpoint while starting or stopping")
        })?;
        let mut state = self.shared.state();
        if state.run.is_some() {
            return Err(ForwardError::InvalidState("can't set remote endpoint while active"));
        }
        state.remote = Some(addr);
        Ok(())
    }

    /// Start listening. Does nothing when already active.
    ///
    /// A bind failure is published as an error notification and returned;
    /// the engine stays idle and may be activated again later.
    pub async fn activate(&self) -> Result<(), ForwardError> {
        let _lifecycle = self.lifecycle.lock().await;
        let (local, remote) = {
            let state = self.shared.state();
            if state.run.is_some() {
                return Ok(());
            }
            match (state.local, state.remote) {
                (Some(local), Some(remote)) => (local, remote),
                _ => {
                    return Err(ForwardError::InvalidState(
                        "local and remote endpoints must be set before activation",
                    ));
                }
            }
        };

        let listener = match TcpListener::bind(local).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = ForwardError::bind(local, e);
                warn!(%local, error = %err, "Listener failed to start");
                self.shared.publish(Notification::error(err.clone()));
                return Err(err);
            }
        };
        let bound = listener.local_addr().unwrap_or(local);

        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            bound,
            remote,
            stop_rx,
        ));
        self.shared.state().run = Some(Run {
            stop_tx,
            accept_task: Some(accept_task),
            bound,
        });

        info!(local = %bound, %remote, "Listener enabled");
        self.shared.publish(Notification::activated());
        Ok(())
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    /// Does nothing when idle.
    ///
    /// The engine reports itself active, and rejects reconfiguration, until
    /// the listening socket has been released.
    pub async fn deactivate(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let accept_task = {
            let mut state = self.shared.state();
            let Some(run) = state.run.as_mut() else {
                return;
            };
            let _ = run.stop_tx.send(true);
            run.accept_task.take()
        };
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        let Some(run) = self.shared.state().run.take() else {
            return;
        };
        info!(local = %run.bound, "Listener disabled");
        self.shared.publish(Notification::deactivated());
    }

    pub fn reset_counter(&self) {
        self.shared.state().total_connections = 0;
    }

    pub fn active(&self) -> bool {
        self.shared.state().run.is_some()
    }

    pub fn current_connections(&self) -> usize {
        self.shared.state().current_connections
    }

    pub fn total_connections(&self) -> u64 {
        self.shared.state().total_connections
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.shared.state().local
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.shared.state().remote
    }

    /// Address actually listened on while active (resolves port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.shared.state().run.as_ref().map(|run| run.bound)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.bus.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Retained transmissions, oldest first.
    pub fn transmissions(&self) -> Vec<Arc<Transmission>> {
        self.shared.history().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.shared.history().clear();
    }

    /// Wait until no session is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn ensure_idle(&self) -> Result<(), ForwardError> {
        if self.active() {
            return Err(ForwardError::InvalidState("can't reconfigure while active"));
        }
        Ok(())
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        if let Some(run) = self.shared.state().run.take() {
            let _ = run.stop_tx.send(true);
        }
    }
}

impl fmt::Display for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        let show = |addr: Option<SocketAddr>| addr.map_or_else(|| "?".to_string(), |a| a.to_string());
        write!(f, "{} -> {}", show(state.local), show(state.remote))
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    bound: SocketAddr,
    remote: SocketAddr,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let session_stop = stop_rx.clone();
        tokio::select! {
            biased;
            () = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    shared.connection_opened();
                    let transmission = Arc::new(Transmission::new(peer, remote));
                    shared.remember(&transmission);
                    debug!(%peer, id = %transmission.id(), "Accepted connection");
                    let guard = ConnectionGuard::new(Arc::clone(&shared), Arc::clone(&transmission));
                    let session = RelaySession::new(
                        Arc::clone(&shared),
                        transmission,
                        session_stop,
                        guard,
                    );
                    tokio::spawn(session.run(stream));
                }
                Err(e) => {
                    warn!(local = %bound, error = %e, "Accept failed");
                    shared.publish(Notification::error(ForwardError::transport(bound, e)));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn activate_requires_endpoints() {
        let fw = Forwarder::default();
        let err = fw.activate().await.unwrap_err();
        assert!(matches!(err, ForwardError::InvalidState(_)));
        assert!(!fw.active());
    }

    #[tokio::test]
    async fn reconfiguring_while_active_is_rejected() {
        let fw = Forwarder::default();
        fw.set_local_addr(loopback()).unwrap();
        fw.set_remote_addr("127.0.0.1:9".parse().unwrap()).unwrap();
        fw.activate().await.unwrap();

        let err = fw.set_remote("10.0.0.1", 80).await.unwrap_err();
        assert!(matches!(err, ForwardError::InvalidState(_)));
        assert!(fw.set_local_addr("127.0.0.1:1".parse().unwrap()).is_err());
        assert_eq!(fw.remote(), Some("127.0.0.1:9".parse().unwrap()));
        assert_eq!(fw.local(), Some(loopback()));

        fw.deactivate().await;
        fw.set_remote("10.0.0.1", 80).await.unwrap();
        assert_eq!(fw.remote(), Some("10.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn activate_and_deactivate_are_idempotent() {
        let fw = Forwarder::default();
        let mut rx = fw.subscribe();
        fw.set_local_addr(loopback()).unwrap();
        fw.set_remote_addr("127.0.0.1:9".parse().unwrap()).unwrap();

        fw.activate().await.unwrap();
        let bound = fw.bound_addr().unwrap();
        fw.activate().await.unwrap();
        assert_eq!(fw.bound_addr(), Some(bound));

        fw.deactivate().await;
        fw.deactivate().await;
        assert!(!fw.active());
        assert!(fw.bound_addr().is_none());

        assert!(matches!(rx.recv().await.unwrap().kind, NotificationKind::Activated));
        assert!(matches!(rx.recv().await.unwrap().kind, NotificationKind::Deactivated));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_failure_leaves_engine_idle() {
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let fw = Forwarder::default();
        let mut rx = fw.subscribe();
        fw.set_local_addr(taken.local_addr().unwrap()).unwrap();
        fw.set_remote_addr("127.0.0.1:9".parse().unwrap()).unwrap();

        let err = fw.activate().await.unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
        assert!(!fw.active());
        let n = rx.recv().await.unwrap();
        assert!(matches!(n.error_detail(), Some(ForwardError::Bind { .. })));

        drop(taken);
        fw.activate().await.unwrap();
        assert!(fw.active());
        fw.deactivate().await;
    }

    #[tokio::test]
    async fn engine_stays_active_until_listener_is_released() {
        let port = std::net::TcpListener::bind(loopback())
            .unwrap()
            .local_addr()
            .unwrap();
        let fw = Forwarder::default();
        fw.set_local_addr(port).unwrap();
        fw.set_remote_addr("127.0.0.1:9".parse().unwrap()).unwrap();
        fw.activate().await.unwrap();

        let ((), (active_while_stopping, reconfigure, reactivate)) = tokio::join!(
            fw.deactivate(),
            async {
                let active = fw.active();
                let reconfigure = fw.set_local_addr(loopback());
                let reactivate = fw.activate().await;
                (active, reconfigure, reactivate)
            }
        );

        assert!(active_while_stopping);
        assert!(matches!(reconfigure, Err(ForwardError::InvalidState(_))));
        reactivate.unwrap();
        assert!(fw.active());
        assert_eq!(fw.local(), Some(port));
        assert_eq!(fw.bound_addr(), Some(port));
        fw.deactivate().await;
    }

    #[tokio::test]
    async fn reset_counter_only_touches_total() {
        let fw = Forwarder::default();
        fw.shared.connection_opened();
        fw.shared.connection_opened();
        fw.reset_counter();
        assert_eq!(fw.total_connections(), 0);
        assert_eq!(fw.current_connections(), 2);
        fw.shared.connection_closed();
        fw.shared.connection_closed();
        fw.wait_idle().await;
        assert_eq!(fw.current_connections(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let fw = Forwarder::new(EngineConfig::default().with_history_capacity(2));
        let addr = loopback();
        for _ in 0..3 {
            fw.shared.remember(&Arc::new(Transmission::new(addr, addr)));
        }
        assert_eq!(fw.transmissions().len(), 2);
        fw.clear_history();
        assert!(fw.transmissions().is_empty());
    }

    #[test]
    fn display_shows_both_endpoints() {
        let fw = Forwarder::default();
        assert_eq!(fw.to_string(), "? -> ?");
        fw.set_local_addr("127.0.0.1:8088".parse().unwrap()).unwrap();
        fw.set_remote_addr("127.0.0.1:33211".parse().unwrap()).unwrap();
        assert_eq!(fw.to_string(), "127.0.0.1:8088 -> 127.0.0.1:33211");
    }
}
