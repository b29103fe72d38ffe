use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorCode};
use crate::loom_exports::cell::UnsafeCell;
use crate::loom_exports::sync::{Condvar, Mutex, MutexGuard};

/// Identifier of a reader of a [`Ring`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReaderId(usize);

/// Observable state of a ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Unlocked, and no reader needs its sample any more.
    Writable,
    /// Being written.
    LockedForWrite,
    /// Being read by the given number of readers.
    LockedForRead(u32),
    /// Unlocked and holding a sample that readers may still need.
    Free,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotLock {
    Idle,
    Write,
    Read(u32),
}

#[derive(Clone, Copy, Debug)]
struct ReaderConfig {
    lag: u64,
    period: u64,
}

/// Builder of a [`Ring`].
///
/// The capacity of the ring is derived from the largest reader lag, so all
/// readers must be registered before the ring is built.
#[derive(Debug)]
pub struct RingBuilder {
    sample_bytes: usize,
    writer_period: u64,
    readers: Vec<ReaderConfig>,
}

impl RingBuilder {
    /// Creates a builder for samples of `sample_bytes` bytes written every
    /// `writer_period` base samples.
    pub fn new(sample_bytes: usize, writer_period: u64) -> Self {
        Self {
            sample_bytes,
            writer_period: writer_period.max(1),
            readers: Vec::new(),
        }
    }

    /// Registers a reader serviced every `period` base samples and reading
    /// with a lag of `lag` writer samples.
    pub fn add_reader(&mut self, lag: u64, period: u64) -> ReaderId {
        self.readers.push(ReaderConfig {
            lag,
            period: period.max(1),
        });

        ReaderId(self.readers.len() - 1)
    }

    /// Builds the ring and initializes its locks.
    pub fn build(self) -> Arc<Ring> {
        let max_lag = self.readers.iter().map(|r| r.lag).max().unwrap_or(0);
        let capacity = max_lag as usize + 1;
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(vec![0u8; self.sample_bytes]))
            .collect();

        let ring = Ring {
            sample_bytes: self.sample_bytes,
            writer_period: self.writer_period,
            state: Mutex::new(RingState {
                written: 0,
                locks: vec![SlotLock::Idle; capacity],
                watermarks: vec![0; self.readers.len()],
                aborted: false,
            }),
            changed: Condvar::new(),
            readers: self.readers,
            slots,
        };
        ring.init_inter_thread_locks();

        Arc::new(ring)
    }
}

struct RingState {
    /// Number of committed samples; also the index of the due sample.
    written: i64,
    locks: Vec<SlotLock>,
    /// Oldest sample each reader may still lock.
    watermarks: Vec<i64>,
    aborted: bool,
}

impl RingState {
    fn min_watermark(&self) -> i64 {
        self.watermarks.iter().copied().min().unwrap_or(i64::MAX)
    }
}

/// A fixed-capacity ring of samples with one writer and several readers.
///
/// Sample `k` lives in slot `k mod capacity`. The ring starts with
/// `capacity` zeroed samples of negative index, so that readers with a lag
/// have something to read before the writer produced anything.
///
/// The writer may only overwrite a slot once no reader needs its sample any
/// more, i.e. once every reader's watermark moved past it and no read lock
/// is held; a reader may only lock a committed sample within its lag window.
/// Both sides block until these conditions are met, without timeout: the
/// waits end by progress of the other side or by [`Ring::abort`].
pub struct Ring {
    sample_bytes: usize,
    writer_period: u64,
    readers: Vec<ReaderConfig>,
    state: Mutex<RingState>,
    changed: Condvar,
    slots: Box<[UnsafeCell<Vec<u8>>]>,
}

// SAFETY: slot contents are only accessed by the holder of the matching
// slot lock, and locks are managed under the state mutex.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the size of a sample in bytes.
    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    /// Returns the index of the next sample to be written.
    pub fn due(&self) -> i64 {
        self.state.lock().unwrap().written
    }

    /// Returns the state of a slot.
    pub fn slot_state(&self, slot: usize) -> SlotState {
        let state = self.state.lock().unwrap();
        match state.locks[slot] {
            SlotLock::Write => SlotState::LockedForWrite,
            SlotLock::Read(n) => SlotState::LockedForRead(n),
            SlotLock::Idle => {
                let sample = self.sample_in_slot(state.written, slot);
                if sample < state.min_watermark() {
                    SlotState::Writable
                } else {
                    SlotState::Free
                }
            }
        }
    }

    /// Returns the writer sample read by `reader` when serviced at base time
    /// `time`.
    pub fn sample_for(&self, reader: ReaderId, time: u64) -> i64 {
        (time / self.writer_period) as i64 - self.readers[reader.0].lag as i64
    }

    /// Returns the watermark of `reader` after its service at base time
    /// `time`, i.e. the sample it will read at its next service.
    pub fn next_watermark(&self, reader: ReaderId, time: u64) -> i64 {
        let config = self.readers[reader.0];

        self.sample_for(reader, time + config.period)
    }

    /// Resets the ring to its initial state.
    ///
    /// All slots hold zeroed samples `-capacity..-1` and are unlocked, and
    /// each reader's watermark is the first sample it will request, so the
    /// initial ownership of every slot is fixed before any thread runs.
    pub(crate) fn init_inter_thread_locks(&self) {
        let mut state = self.state.lock().unwrap();
        state.written = 0;
        state.aborted = false;
        for lock in state.locks.iter_mut() {
            *lock = SlotLock::Idle;
        }
        for (watermark, reader) in state.watermarks.iter_mut().zip(&self.readers) {
            *watermark = -(reader.lag as i64);
        }
        for slot in self.slots.iter() {
            // SAFETY: no lock is held, hence no guard exists.
            slot.with_mut(|buf| unsafe { (*buf).fill(0) });
        }
    }

    /// Locks the due sample for writing.
    ///
    /// Blocks while a reader still needs the sample stored in the due slot.
    pub fn write(self: &Arc<Self>) -> Result<WriteGuard, Error> {
        let capacity = self.capacity() as i64;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.aborted {
                return Err(aborted());
            }
            let sample = state.written;
            let slot = self.slot_of(sample);
            if state.locks[slot] == SlotLock::Idle && state.min_watermark() > sample - capacity {
                state.locks[slot] = SlotLock::Write;

                return Ok(WriteGuard {
                    ring: self.clone(),
                    slot,
                    sample,
                    committed: false,
                });
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Locks a sample for reading.
    ///
    /// Blocks until the sample is committed. Asking for a sample the reader
    /// already released is `E_NOT_COMPLIANT`.
    pub fn read(self: &Arc<Self>, reader: ReaderId, sample: i64) -> Result<ReadGuard, Error> {
        let mut state = self.state.lock().unwrap();
        let watermark = state.watermarks[reader.0];
        if sample < watermark {
            return Err(Error::new(
                ErrorCode::NotCompliant,
                format!(
                    "sample {} requested outside the lag window (oldest available is {})",
                    sample, watermark
                ),
            ));
        }
        let slot = self.slot_of(sample);
        loop {
            if state.aborted {
                return Err(aborted());
            }
            if state.written > sample {
                match state.locks[slot] {
                    SlotLock::Idle => state.locks[slot] = SlotLock::Read(1),
                    SlotLock::Read(n) => state.locks[slot] = SlotLock::Read(n + 1),
                    SlotLock::Write => {
                        state = self.changed.wait(state).unwrap();
                        continue;
                    }
                }

                return Ok(ReadGuard {
                    ring: self.clone(),
                    slot,
                    sample,
                });
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Declares that `reader` will not request samples older than
    /// `watermark`.
    pub fn release_until(&self, reader: ReaderId, watermark: i64) {
        let mut state = self.state.lock().unwrap();
        let current = &mut state.watermarks[reader.0];
        if watermark > *current {
            *current = watermark;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Declares that `reader` will not request any more samples.
    pub fn retire_reader(&self, reader: ReaderId) {
        self.release_until(reader, i64::MAX);
    }

    /// Makes all current and future waits fail.
    pub fn abort(&self) {
        self.state.lock().unwrap().aborted = true;
        self.changed.notify_all();
    }

    fn slot_of(&self, sample: i64) -> usize {
        sample.rem_euclid(self.capacity() as i64) as usize
    }

    /// Returns the sample currently stored in a slot.
    fn sample_in_slot(&self, written: i64, slot: usize) -> i64 {
        let capacity = self.capacity() as i64;
        let last = written - 1;

        last - (last - slot as i64).rem_euclid(capacity)
    }

    fn unlock(&self, slot: usize, commit: bool) {
        let mut state: MutexGuard<'_, RingState> = self.state.lock().unwrap();
        state.locks[slot] = match state.locks[slot] {
            SlotLock::Read(n) if n > 1 => SlotLock::Read(n - 1),
            _ => SlotLock::Idle,
        };
        if commit {
            state.written += 1;
        }
        drop(state);
        self.changed.notify_all();
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("sample_bytes", &self.sample_bytes)
            .finish_non_exhaustive()
    }
}

fn aborted() -> Error {
    Error::new(ErrorCode::ThreadError, "ring buffer wait interrupted")
}

/// A read lock on a committed sample.
pub struct ReadGuard {
    ring: Arc<Ring>,
    slot: usize,
    sample: i64,
}

impl ReadGuard {
    /// Returns the index of the locked sample.
    pub fn sample(&self) -> i64 {
        self.sample
    }

    /// Returns the content of the sample.
    pub fn bytes(&self) -> &[u8] {
        let ptr = self.ring.slots[self.slot].with(|p| p);
        // SAFETY: the read lock prevents the writer from locking the slot.
        unsafe { (*ptr).as_slice() }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.ring.unlock(self.slot, false);
    }
}

impl fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("sample", &self.sample)
            .finish_non_exhaustive()
    }
}

/// A write lock on the due sample.
///
/// The sample becomes visible to readers when the guard is committed; a
/// guard dropped without commit leaves the sample due.
pub struct WriteGuard {
    ring: Arc<Ring>,
    slot: usize,
    sample: i64,
    committed: bool,
}

impl WriteGuard {
    /// Returns the index of the locked sample.
    pub fn sample(&self) -> i64 {
        self.sample
    }

    /// Returns the current content of the slot.
    pub fn bytes(&self) -> &[u8] {
        let ptr = self.ring.slots[self.slot].with(|p| p);
        // SAFETY: the write lock excludes every other access to the slot.
        unsafe { (*ptr).as_slice() }
    }

    /// Returns the content of the slot for in-place writing.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let ptr = self.ring.slots[self.slot].with_mut(|p| p);
        // SAFETY: the write lock excludes every other access to the slot.
        unsafe { (*ptr).as_mut_slice() }
    }

    /// Copies a whole sample into the slot.
    ///
    /// The length must match the sample size of the ring, or the write is
    /// `E_NOT_COMPLIANT`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.ring.sample_bytes {
            return Err(Error::new(
                ErrorCode::NotCompliant,
                format!(
                    "wrote {} bytes to an output with {}-byte samples",
                    data.len(),
                    self.ring.sample_bytes
                ),
            ));
        }
        self.bytes_mut().copy_from_slice(data);

        Ok(())
    }

    /// Publishes the sample.
    pub fn commit(mut self) {
        self.committed = true;
        self.ring.unlock(self.slot, true);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.unlock(self.slot, false);
        }
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("sample", &self.sample)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Duration;

    fn encode(sample: i64) -> [u8; 8] {
        sample.to_le_bytes()
    }

    fn decode(bytes: &[u8]) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        i64::from_le_bytes(b)
    }

    #[test]
    fn initial_history_is_zeroed() {
        let mut builder = RingBuilder::new(8, 1);
        let reader = builder.add_reader(2, 1);
        let ring = builder.build();

        assert_eq!(ring.capacity(), 3);
        assert_eq!(ring.due(), 0);
        assert_eq!(ring.sample_for(reader, 0), -2);

        let guard = ring.read(reader, -2).unwrap();
        assert_eq!(guard.bytes(), &[0u8; 8]);
        assert_eq!(ring.slot_state(1), SlotState::LockedForRead(1));
        drop(guard);
        assert_eq!(ring.slot_state(1), SlotState::Free);
    }

    #[test]
    fn reads_outside_window_are_not_compliant() {
        let mut builder = RingBuilder::new(8, 1);
        let reader = builder.add_reader(1, 1);
        let ring = builder.build();

        ring.release_until(reader, 0);
        let err = ring.read(reader, -1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotCompliant);
    }

    #[test]
    fn write_size_is_checked() {
        let ring = RingBuilder::new(4, 1).build();
        let mut guard = ring.write().unwrap();
        assert_eq!(ring.slot_state(0), SlotState::LockedForWrite);
        assert_eq!(
            guard.write(&[1, 2, 3]).unwrap_err().code(),
            ErrorCode::NotCompliant
        );
        guard.write(&[1, 2, 3, 4]).unwrap();
        guard.commit();
        assert_eq!(ring.due(), 1);
    }

    #[test]
    fn writer_waits_for_slow_reader() {
        let mut builder = RingBuilder::new(8, 1);
        let reader = builder.add_reader(1, 1);
        let ring = builder.build();

        let mut guard = ring.write().unwrap();
        guard.write(&encode(0)).unwrap();
        guard.commit();

        // Capacity 2: sample 1 goes to the slot of sample -1, which the
        // reader has not consumed yet.
        let blocked = thread::spawn({
            let ring = ring.clone();
            move || {
                let mut guard = ring.write().unwrap();
                guard.write(&encode(1)).unwrap();
                guard.commit();
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.due(), 1);

        let guard = ring.read(reader, -1).unwrap();
        assert_eq!(decode(guard.bytes()), 0);
        drop(guard);
        ring.release_until(reader, 0);

        blocked.join().unwrap();
        assert_eq!(ring.due(), 2);
        assert_eq!(decode(ring.read(reader, 0).unwrap().bytes()), 0);
        assert_eq!(decode(ring.read(reader, 1).unwrap().bytes()), 1);
    }

    #[test]
    fn abort_unblocks_waiters() {
        let mut builder = RingBuilder::new(8, 1);
        let reader = builder.add_reader(1, 1);
        let ring = builder.build();

        let waiting_reader = thread::spawn({
            let ring = ring.clone();
            move || ring.read(reader, 5).map(|_| ())
        });

        thread::sleep(Duration::from_millis(20));
        ring.abort();

        let err = waiting_reader.join().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ThreadError);
        assert!(ring.write().is_err());
    }

    #[test]
    fn concurrent_reader_sees_every_sample_intact() {
        const SAMPLES: i64 = 500;

        let mut builder = RingBuilder::new(64, 1);
        let fast = builder.add_reader(1, 1);
        let slow = builder.add_reader(3, 2);
        let ring = builder.build();

        let writer = thread::spawn({
            let ring = ring.clone();
            move || {
                for sample in 0..SAMPLES {
                    let mut guard = ring.write().unwrap();
                    for chunk in guard.bytes_mut().chunks_mut(8) {
                        chunk.copy_from_slice(&encode(sample));
                    }
                    guard.commit();
                }
            }
        });

        let spawn_reader = |reader: ReaderId, period: u64| {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut time = 0;
                while (time as i64) < SAMPLES {
                    let sample = ring.sample_for(reader, time);
                    {
                        let guard = ring.read(reader, sample).unwrap();
                        let expected = if sample < 0 { 0 } else { sample };
                        for chunk in guard.bytes().chunks(8) {
                            assert_eq!(decode(chunk), expected);
                        }
                    }
                    ring.release_until(reader, ring.next_watermark(reader, time));
                    time += period;
                }
                ring.retire_reader(reader);
            })
        };

        let readers = [spawn_reader(fast, 1), spawn_reader(slow, 2)];
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}

#[cfg(all(test, brahms_loom))]
mod tests {
    use super::*;

    use loom::thread;

    #[test]
    fn loom_writer_reader() {
        loom::model(|| {
            let mut builder = RingBuilder::new(1, 1);
            let reader = builder.add_reader(1, 1);
            let ring = builder.build();

            let writer = thread::spawn({
                let ring = ring.clone();
                move || {
                    for sample in 0..3u8 {
                        let mut guard = ring.write().unwrap();
                        guard.write(&[sample + 1]).unwrap();
                        guard.commit();
                    }
                }
            });

            for time in 0..3u64 {
                let sample = ring.sample_for(reader, time);
                let value = ring.read(reader, sample).unwrap().bytes()[0];
                let expected = if sample < 0 { 0 } else { sample as u8 + 1 };
                assert_eq!(value, expected);
                ring.release_until(reader, ring.next_watermark(reader, time));
            }
            ring.retire_reader(reader);

            writer.join().unwrap();
        });
    }
}
