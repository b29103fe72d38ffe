use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::params::VoiceIndex;

use super::{Ipm, Tag, HEADER_SIZE};

/// Buffers kept beyond this count are freed on release.
const MAX_IDLE_BUFFERS: usize = 256;

pub(crate) struct PoolShared {
    voice: VoiceIndex,
    idle: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl PoolShared {
    pub(super) fn recycle(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }
}

/// A pool of recycled message buffers.
///
/// Buffers returned to the pool keep their capacity, so steady-state traffic
/// does not allocate. Cloning yields a handle to the same pool.
#[derive(Clone)]
pub struct IpmPool {
    shared: Arc<PoolShared>,
}

impl IpmPool {
    /// Creates an empty pool whose messages are stamped with `voice`.
    ///
    /// # Panics
    ///
    /// Panics if `voice` is not below
    /// [`MAX_VOICES`](crate::params::MAX_VOICES).
    pub fn new(voice: VoiceIndex) -> Self {
        assert!(
            voice < crate::params::MAX_VOICES,
            "voice index {} does not fit in a message header",
            voice
        );
        Self {
            shared: Arc::new(PoolShared {
                voice,
                idle: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns a fresh message, reusing an idle buffer if possible.
    pub fn get(&self, tag: Tag) -> Ipm {
        let buf = self.shared.idle.lock().unwrap().pop().unwrap_or_else(|| {
            self.shared.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(HEADER_SIZE)
        });

        Ipm::from_pool(buf, self.shared.voice, tag, Arc::downgrade(&self.shared))
    }

    /// Returns the number of idle buffers.
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().unwrap().len()
    }

    /// Returns the number of buffers allocated since the pool was created.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for IpmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmPool")
            .field("voice", &self.shared.voice)
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}
