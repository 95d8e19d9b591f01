//! Configuration types for the broker.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Broker configuration.
///
/// Controls the per-peer window geometry, doorbell batching, and the
/// identity the broker presents during connection establishment.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum in-flight send-class operations per peer. The same number
    /// of receive descriptors is kept posted per peer at all times.
    /// Default: 16
    pub max_in_flight: u32,
    /// Maximum message size in bytes. Each window slot is this large;
    /// send-class payloads must be strictly smaller.
    /// Default: 1024
    pub max_msg_size: u32,
    /// Number of work descriptors accumulated before one hardware post.
    /// Default: 8
    pub doorbell_batch_size: u32,
    /// Local server id. Also used as the memory id for registration.
    pub server_id: u32,
    /// Local worker thread id, part of the queue-pair identity.
    pub thread_id: u32,
    /// Port used for the out-of-band handshake that exchanges memory
    /// attributes and queue-pair identities.
    /// Default: 11211
    pub handshake_port: u16,
    /// Device index to open and register memory against.
    /// Default: 0
    pub device_index: usize,
    /// Retry policy for fetching remote attributes and connecting queue
    /// pairs. Default: fixed 2ms interval, unbounded attempts.
    pub retry_policy: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_msg_size: 1024,
            doorbell_batch_size: 8,
            server_id: 0,
            thread_id: 0,
            handshake_port: 11211,
            device_index: 0,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum in-flight operations per peer.
    pub fn with_max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: u32) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the doorbell batch size.
    pub fn with_doorbell_batch_size(mut self, doorbell_batch_size: u32) -> Self {
        self.doorbell_batch_size = doorbell_batch_size;
        self
    }

    /// Set the local server id.
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Set the local thread id.
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Set the handshake port.
    pub fn with_handshake_port(mut self, handshake_port: u16) -> Self {
        self.handshake_port = handshake_port;
        self
    }

    /// Set the device index.
    pub fn with_device_index(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    /// Set the retry policy for connection establishment.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Bytes of one direction's window for one peer.
    #[inline]
    pub fn window_size(&self) -> usize {
        self.max_in_flight as usize * self.max_msg_size as usize
    }

    /// Bytes of arena consumed per peer (receive window plus send window).
    #[inline]
    pub fn region_size_per_peer(&self) -> usize {
        2 * self.window_size()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::InvalidConfig("max_in_flight must be > 0".into()));
        }
        if self.max_msg_size == 0 {
            return Err(Error::InvalidConfig("max_msg_size must be > 0".into()));
        }
        if self.doorbell_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "doorbell_batch_size must be > 0".into(),
            ));
        }
        // A batch that can hold a whole window would never be submitted
        // by the window-full drain loop.
        if self.doorbell_batch_size > self.max_in_flight {
            return Err(Error::InvalidConfig(
                "doorbell_batch_size must not exceed max_in_flight".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = BrokerConfig::default()
            .with_max_in_flight(32)
            .with_max_msg_size(256)
            .with_doorbell_batch_size(4)
            .with_server_id(7)
            .with_thread_id(2)
            .with_handshake_port(12345);

        assert_eq!(config.max_in_flight, 32);
        assert_eq!(config.max_msg_size, 256);
        assert_eq!(config.doorbell_batch_size, 4);
        assert_eq!(config.server_id, 7);
        assert_eq!(config.thread_id, 2);
        assert_eq!(config.handshake_port, 12345);
        assert_eq!(config.window_size(), 32 * 256);
        assert_eq!(config.region_size_per_peer(), 2 * 32 * 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_window() {
        let config = BrokerConfig::default().with_max_in_flight(0);
        assert!(config.validate().is_err());

        let config = BrokerConfig::default().with_max_msg_size(0);
        assert!(config.validate().is_err());

        let config = BrokerConfig::default().with_doorbell_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_batch_wider_than_window() {
        let config = BrokerConfig::default()
            .with_max_in_flight(4)
            .with_doorbell_batch_size(8);
        assert!(config.validate().is_err());
    }
}
