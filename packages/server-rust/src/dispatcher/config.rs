//! Dispatcher configuration types.

use std::time::Duration;

use hostwire_core::MessageVersion;

/// Top-level configuration for a channel dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of live channels; the accept loop waits while at the cap.
    pub max_concurrent_sessions: usize,
    /// Concurrent requests per sessionless channel when receiving asynchronously.
    pub max_concurrent_calls: usize,
    /// Process every message inline on the channel pump.
    pub receive_synchronously: bool,
    /// Put error messages and cause chains into generic faults. Leaks internals.
    pub include_exception_detail_in_faults: bool,
    /// Generate generic faults for errors no converter handles.
    pub enable_faults: bool,
    /// Leave reply addressing headers to the service.
    pub manual_addressing: bool,
    /// Envelope version used for replies and faults.
    pub message_version: MessageVersion,
    pub timeouts: TimeoutConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            max_concurrent_calls: 16,
            receive_synchronously: false,
            include_exception_detail_in_faults: false,
            enable_faults: true,
            manual_addressing: false,
            message_version: MessageVersion::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Timeouts applied to listener/channel operations and to operation calls.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub open: Duration,
    /// Also bounds how long `close` waits for channels before aborting them.
    pub close: Duration,
    pub receive: Duration,
    pub send: Duration,
    /// Per-call operation timeout; `None` lets operations run unbounded.
    pub operation: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(60),
            close: Duration::from_secs(10),
            receive: Duration::from_secs(600),
            send: Duration::from_secs(60),
            operation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrent_sessions, 100);
        assert_eq!(config.max_concurrent_calls, 16);
        assert!(!config.receive_synchronously);
        assert!(!config.include_exception_detail_in_faults);
        assert!(config.enable_faults);
        assert!(!config.manual_addressing);
        assert_eq!(config.message_version, MessageVersion::Soap12Addressing10);
    }

    #[test]
    fn timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.open, Duration::from_secs(60));
        assert_eq!(config.close, Duration::from_secs(10));
        assert_eq!(config.receive, Duration::from_secs(600));
        assert_eq!(config.send, Duration::from_secs(60));
        assert!(config.operation.is_none());
    }
}
