//! Channel configuration for coordinator / worker communication

/// Channel buffer configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Caller -> coordinator command buffer
    pub command_buffer: usize,

    /// Coordinator -> worker command buffer (per worker)
    pub worker_buffer: usize,

    /// Workers -> coordinator notification buffer
    pub notification_buffer: usize,

    /// Coordinator -> caller event buffer
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer: 16,
            worker_buffer: 16,
            notification_buffer: 256,
            event_buffer: 16,
        }
    }
}

impl ChannelConfig {
    /// Set the caller command buffer size
    pub fn with_command_buffer(mut self, size: usize) -> Self {
        self.command_buffer = size;
        self
    }

    /// Set the per-worker command buffer size
    pub fn with_worker_buffer(mut self, size: usize) -> Self {
        self.worker_buffer = size;
        self
    }

    /// Set the worker notification buffer size
    pub fn with_notification_buffer(mut self, size: usize) -> Self {
        self.notification_buffer = size;
        self
    }

    /// Set the caller event buffer size
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }
}
