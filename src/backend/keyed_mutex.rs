// Keyed mutex on the Vulkan side
//
// Vulkan has no standalone acquire/release call for a D3D11 keyed mutex.
// Both travel with a queue submission as VkWin32KeyedMutexAcquireReleaseInfoKHR:
// the queue acquires before the first command and releases after the last.
// A submission whose acquire times out is not executed and returns VK_TIMEOUT.

use crate::error::{InteropError, InteropResult};
use crate::interop::{AcquireStatus, KeyPair};
use ash::vk;

/// Acquire/release parameters for one imported allocation
pub struct KeyedMutexSubmit {
    memory: [vk::DeviceMemory; 1],
    acquire_keys: [u64; 1],
    release_keys: [u64; 1],
    timeouts_ms: [u32; 1],
}

impl KeyedMutexSubmit {
    pub fn new(memory: vk::DeviceMemory, keys: KeyPair, timeout_ms: u32) -> Self {
        Self {
            memory: [memory],
            acquire_keys: [keys.acquire],
            release_keys: [keys.release],
            timeouts_ms: [timeout_ms],
        }
    }

    /// Chain into a `SubmitInfo` with `push_next`
    pub fn info(&self) -> vk::Win32KeyedMutexAcquireReleaseInfoKHRBuilder<'_> {
        vk::Win32KeyedMutexAcquireReleaseInfoKHR::builder()
            .acquire_syncs(&self.memory)
            .acquire_keys(&self.acquire_keys)
            .acquire_timeouts(&self.timeouts_ms)
            .release_syncs(&self.memory)
            .release_keys(&self.release_keys)
    }
}

/// Interpret the result of a keyed-mutex submission
pub fn classify_submit(result: Result<(), vk::Result>) -> InteropResult<AcquireStatus> {
    match result {
        Ok(()) => Ok(AcquireStatus::Acquired),
        Err(vk::Result::TIMEOUT) => Ok(AcquireStatus::TimedOut),
        Err(vk::Result::ERROR_DEVICE_LOST) => Err(InteropError::sync_fatal(
            "queue submit with keyed mutex",
            "device lost",
        )),
        Err(e) => Err(InteropError::sync_fatal(
            "queue submit with keyed mutex",
            format!("{:?}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_not_an_error() {
        assert_eq!(classify_submit(Ok(())).unwrap(), AcquireStatus::Acquired);
        assert_eq!(
            classify_submit(Err(vk::Result::TIMEOUT)).unwrap(),
            AcquireStatus::TimedOut
        );
    }

    #[test]
    fn other_failures_are_fatal() {
        for code in [vk::Result::ERROR_DEVICE_LOST, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY] {
            assert!(matches!(
                classify_submit(Err(code)),
                Err(InteropError::SyncFatal { .. })
            ));
        }
    }

    #[test]
    fn info_carries_one_sync_each_way() {
        let submit = KeyedMutexSubmit::new(vk::DeviceMemory::null(), KeyPair::new(1, 0), 5);
        let info = submit.info();
        assert_eq!(info.acquire_count, 1);
        assert_eq!(info.release_count, 1);
        assert_eq!(unsafe { *info.p_acquire_keys }, 1);
        assert_eq!(unsafe { *info.p_release_keys }, 0);
        assert_eq!(unsafe { *info.p_acquire_timeouts }, 5);
    }
}
