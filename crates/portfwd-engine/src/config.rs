//! Engine tuning.

use std::time::Duration;

use portfwd_core::EngineSettings;

/// Runtime knobs shared by a [`Forwarder`](crate::Forwarder) and its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for a session's outbound connect.
    pub connect_timeout: Duration,
    /// Cadence of the per-session liveness and stop check.
    pub liveness_interval: Duration,
    /// Largest chunk read in one go.
    pub read_buffer_size: usize,
    /// Queue length per notification subscriber.
    pub event_capacity: usize,
    /// Transmissions retained by the engine (0 keeps none past their session).
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            liveness_interval: Duration::from_millis(settings.liveness_interval_ms.max(1)),
            read_buffer_size: settings.read_buffer_size.max(1),
            event_capacity: settings.event_capacity.max(1),
            history_capacity: settings.history_capacity,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
