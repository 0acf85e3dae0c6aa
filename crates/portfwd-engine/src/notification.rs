//! Engine notifications and the bus that carries them.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::error::ForwardError;
use crate::transmission::Transmission;

/// What happened.
#[derive(Debug, Clone)]
pub enum NotificationKind {
    Error(ForwardError),
    Activated,
    Deactivated,
    TransmissionStarted,
    TransmissionSent { bytes: usize },
    TransmissionReceived { bytes: usize },
    TransmissionEnded,
}

/// A timestamped engine event.
///
/// Holds only a weak reference to the transmission it concerns; it stays
/// readable for as long as the session or the engine history keeps it.
#[derive(Debug, Clone)]
pub struct Notification {
    pub timestamp: SystemTime,
    pub kind: NotificationKind,
    transmission: Weak<Transmission>,
}

impl Notification {
    fn new(kind: NotificationKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            kind,
            transmission: Weak::new(),
        }
    }

    fn about(kind: NotificationKind, transmission: &Arc<Transmission>) -> Self {
        Self {
            transmission: Arc::downgrade(transmission),
            ..Self::new(kind)
        }
    }

    pub(crate) fn error(error: ForwardError) -> Self {
        Self::new(NotificationKind::Error(error))
    }

    pub(crate) fn activated() -> Self {
        Self::new(NotificationKind::Activated)
    }

    pub(crate) fn deactivated() -> Self {
        Self::new(NotificationKind::Deactivated)
    }

    pub(crate) fn started(transmission: &Arc<Transmission>) -> Self {
        Self::about(NotificationKind::TransmissionStarted, transmission)
    }

    pub(crate) fn sent(transmission: &Arc<Transmission>, bytes: usize) -> Self {
        Self::about(NotificationKind::TransmissionSent { bytes }, transmission)
    }

    pub(crate) fn received(transmission: &Arc<Transmission>, bytes: usize) -> Self {
        Self::about(NotificationKind::TransmissionReceived { bytes }, transmission)
    }

    pub(crate) fn ended(transmission: &Arc<Transmission>) -> Self {
        Self::about(NotificationKind::TransmissionEnded, transmission)
    }

    /// The transmission this event refers to, if it is still retained.
    pub fn transmission(&self) -> Option<Arc<Transmission>> {
        self.transmission.upgrade()
    }

    pub fn error_detail(&self) -> Option<&ForwardError> {
        match &self.kind {
            NotificationKind::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Short description for display.
    pub fn message(&self) -> String {
        match &self.kind {
            NotificationKind::Error(e) => e.to_string(),
            NotificationKind::Activated => "Listener enabled".to_string(),
            NotificationKind::Deactivated => "Listener disabled".to_string(),
            NotificationKind::TransmissionStarted => match self.transmission() {
                Some(t) => format!("Transmission from {}", t.source()),
                None => "Transmission started".to_string(),
            },
            NotificationKind::TransmissionSent { bytes } => format!("Sent {bytes} bytes"),
            NotificationKind::TransmissionReceived { bytes } => format!("Received {bytes} bytes"),
            NotificationKind::TransmissionEnded => "Transmission ended".to_string(),
        }
    }
}

/// Fan-out point for notifications. Each subscriber gets its own queue.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Never blocks. Dropped silently when nobody is subscribed.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
