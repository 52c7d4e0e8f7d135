// Keyed-mutex protocol between one producer and one consumer
//
// A release with key K hands the memory to whoever next acquires with K.
// The two sides therefore pair up as
//   producer.release == consumer.acquire
//   consumer.release == producer.acquire
// which holds both for the shared-zero protocol (every key 0, whoever asks
// first wins) and for the alternating hand-off (0 -> 1 -> 0 ...).

use crate::error::{InteropError, InteropResult};
use serde::Deserialize;
use std::time::Duration;

/// Keys one side uses on each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub acquire: u64,
    pub release: u64,
}

impl KeyPair {
    pub const fn new(acquire: u64, release: u64) -> Self {
        Self { acquire, release }
    }
}

/// Whether the keyed mutex is used every frame at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    PerFrame,
    /// Static texture: written once at creation, sampled without the mutex
    Unsynchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProtocol {
    pub mode: SyncMode,
    pub producer: KeyPair,
    pub consumer: KeyPair,
    pub timeout: Duration,
    /// Release after a timed-out acquire as well (release-without-acquire heartbeat)
    pub release_on_timeout: bool,
}

impl SyncProtocol {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5);

    /// Single writer, single reader, every key 0
    pub fn shared_zero() -> Self {
        Self {
            mode: SyncMode::PerFrame,
            producer: KeyPair::new(0, 0),
            consumer: KeyPair::new(0, 0),
            timeout: Self::DEFAULT_TIMEOUT,
            release_on_timeout: true,
        }
    }

    /// Strict hand-off: producer 0 -> 1, consumer 1 -> 0
    pub fn alternating() -> Self {
        Self {
            producer: KeyPair::new(0, 1),
            consumer: KeyPair::new(1, 0),
            ..Self::shared_zero()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_release_on_timeout(mut self, enabled: bool) -> Self {
        self.release_on_timeout = enabled;
        self
    }

    pub fn is_synchronized(&self) -> bool {
        self.mode == SyncMode::PerFrame
    }

    /// Timeout in whole milliseconds, as the OS calls take it
    pub fn timeout_ms(&self) -> u32 {
        self.timeout.as_millis().min(u32::MAX as u128) as u32
    }

    pub fn validate(&self) -> InteropResult<()> {
        if self.producer.release != self.consumer.acquire {
            return Err(InteropError::Protocol(format!(
                "producer releases with key {} but consumer acquires with key {}",
                self.producer.release, self.consumer.acquire
            )));
        }
        if self.consumer.release != self.producer.acquire {
            return Err(InteropError::Protocol(format!(
                "consumer releases with key {} but producer acquires with key {}",
                self.consumer.release, self.producer.acquire
            )));
        }
        if self.is_synchronized() && self.timeout.is_zero() && self.producer != self.consumer {
            // A zero timeout on a strict hand-off only ever succeeds by luck
            log::warn!("alternating keyed-mutex protocol with a zero acquire timeout");
        }
        Ok(())
    }
}

impl Default for SyncProtocol {
    fn default() -> Self {
        Self::shared_zero()
    }
}
