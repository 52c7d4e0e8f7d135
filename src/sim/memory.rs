// Physical image memory and its keyed mutex, as the simulated driver sees them
//
// Texels are individual atomics and clears store them one by one, so a
// reader that skips the keyed mutex can observe a half-written frame. The
// mutex itself (lock + condvar) is what orders a writer's stores before a
// reader's loads.

use crate::interop::{AcquireStatus, ReleaseStatus};
use crate::texture::TextureDesc;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub(crate) struct PhysicalImageMemory {
    desc: TextureDesc,
    owner: u64,
    texels: Box<[AtomicU32]>,
    mutex: KeyedMutexCore,
}

impl PhysicalImageMemory {
    pub(crate) fn new(desc: TextureDesc, owner: u64, initial: &[u32]) -> Self {
        let texels = (0..desc.texel_count())
            .map(|i| AtomicU32::new(initial.get(i).copied().unwrap_or(0)))
            .collect();
        Self {
            desc,
            owner,
            texels,
            mutex: KeyedMutexCore::new(),
        }
    }

    pub(crate) fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn byte_size(&self) -> u64 {
        self.texels.len() as u64 * self.desc.format.bytes_per_pixel() as u64
    }

    pub(crate) fn keyed_mutex(&self) -> &KeyedMutexCore {
        &self.mutex
    }

    pub(crate) fn fill(&self, texel: u32) {
        for t in self.texels.iter() {
            t.store(texel, Ordering::Relaxed);
        }
    }

    pub(crate) fn texel(&self, index: usize) -> Option<u32> {
        self.texels.get(index).map(|t| t.load(Ordering::Relaxed))
    }

    pub(crate) fn snapshot(&self) -> Vec<u32> {
        self.texels
            .iter()
            .map(|t| t.load(Ordering::Relaxed))
            .collect()
    }
}

impl std::fmt::Debug for PhysicalImageMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalImageMemory")
            .field("desc", &self.desc)
            .field("owner", &self.owner)
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MutexFault {
    RecursiveAcquire,
    Abandoned,
}

impl MutexFault {
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::RecursiveAcquire => "this side already holds the mutex",
            Self::Abandoned => "the previous owner was destroyed while holding the mutex",
        }
    }
}

#[derive(Debug)]
struct MutexState {
    owner: Option<u64>,
    key: u64,
    abandoned: bool,
}

/// Keyed mutex shared by every side bound to one physical memory block
#[derive(Debug)]
pub(crate) struct KeyedMutexCore {
    state: Mutex<MutexState>,
    released: Condvar,
}

impl KeyedMutexCore {
    fn new() -> Self {
        Self {
            state: Mutex::new(MutexState {
                owner: None,
                key: 0,
                abandoned: false,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(
        &self,
        side: u64,
        key: u64,
        timeout: Duration,
    ) -> Result<AcquireStatus, MutexFault> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        if state.owner == Some(side) {
            return Err(MutexFault::RecursiveAcquire);
        }

        loop {
            if state.abandoned {
                return Err(MutexFault::Abandoned);
            }
            if state.owner.is_none() && state.key == key {
                state.owner = Some(side);
                return Ok(AcquireStatus::Acquired);
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out() {
                        // One last look: a release may have raced the deadline
                        if !state.abandoned && state.owner.is_none() && state.key == key {
                            state.owner = Some(side);
                            return Ok(AcquireStatus::Acquired);
                        }
                        return Ok(AcquireStatus::TimedOut);
                    }
                }
                None => self.released.wait(&mut state),
            }
        }
    }

    pub(crate) fn release(&self, side: u64, key: u64) -> ReleaseStatus {
        let mut state = self.state.lock();
        if state.owner != Some(side) {
            return ReleaseStatus::NotHeld;
        }
        state.owner = None;
        state.key = key;
        self.released.notify_all();
        ReleaseStatus::Released
    }

    /// The holder went away without releasing
    pub(crate) fn abandon(&self, side: u64) {
        let mut state = self.state.lock();
        if state.owner == Some(side) {
            state.owner = None;
            state.abandoned = true;
            self.released.notify_all();
        }
    }

    pub(crate) fn holder(&self) -> Option<u64> {
        self.state.lock().owner
    }
}
