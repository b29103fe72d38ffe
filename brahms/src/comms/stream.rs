use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, Tag};
use crate::params::VoiceIndex;
use crate::ports::Ring;
use crate::sync::{CancelFlag, WAIT_STEP};

use super::Outlets;

/// Routes received samples to the mirror rings of their streams.
pub(crate) struct StreamRouter {
    routes: Mutex<HashMap<u32, Arc<Ring>>>,
}

impl StreamRouter {
    pub(super) fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, stream: u32, ring: Arc<Ring>) {
        self.routes.lock().unwrap().insert(stream, ring);
    }

    /// Writes a sample into the mirror ring of a stream.
    ///
    /// Blocks while the local consumers still need the slot to be written.
    pub(crate) fn deliver(&self, stream: u32, sample: &[u8]) -> Result<(), Error> {
        let ring = self
            .routes
            .lock()
            .unwrap()
            .get(&stream)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::Comms,
                    format!("data received on unknown stream {}", stream),
                )
            })?;

        let mut guard = ring.write()?;
        guard.write(sample).map_err(|e| {
            Error::new(ErrorCode::Comms, e.message()).trace(format!("on stream {}", stream))
        })?;
        guard.commit();

        Ok(())
    }
}

impl fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRouter")
            .field("streams", &self.routes.lock().unwrap().len())
            .finish()
    }
}

struct StreamBuffers {
    free: Mutex<Vec<Vec<u8>>>,
    returned: Condvar,
}

impl StreamBuffers {
    fn put(&self, buf: Vec<u8>) {
        self.free.lock().unwrap().push(buf);
        self.returned.notify_one();
    }

    fn take(&self, cancel: &CancelFlag) -> Result<Vec<u8>, Error> {
        let mut free = self.free.lock().unwrap();
        loop {
            if let Some(buf) = free.pop() {
                return Ok(buf);
            }
            if cancel.is_cancelled() {
                return Err(Error::new(ErrorCode::Cancelled, "execution cancelled"));
            }
            free = self.returned.wait_timeout(free, WAIT_STEP).unwrap().0;
        }
    }
}

/// Sends the samples of an output to its remote subscribers.
///
/// Each sample is sent as a `PUSHDATA` message built in one of a fixed set
/// of stream buffers. A buffer returns to the set when the message is
/// released after delivery, so the number of samples in flight is bounded
/// and a slow subscriber eventually blocks the producer.
pub(crate) struct Forwarder {
    voice: VoiceIndex,
    outlets: Arc<Outlets>,
    targets: Vec<(VoiceIndex, u32)>,
    buffers: Arc<StreamBuffers>,
}

impl Forwarder {
    pub(super) fn new(
        voice: VoiceIndex,
        outlets: Arc<Outlets>,
        targets: Vec<(VoiceIndex, u32)>,
        buffers: usize,
    ) -> Self {
        let buffers = (0..buffers.max(1)).map(|_| Vec::new()).collect();

        Self {
            voice,
            outlets,
            targets,
            buffers: Arc::new(StreamBuffers {
                free: Mutex::new(buffers),
                returned: Condvar::new(),
            }),
        }
    }

    /// Sends a sample to every subscriber.
    pub(crate) fn forward(&self, sample: &[u8], cancel: &CancelFlag) -> Result<(), Error> {
        for &(peer, stream) in &self.targets {
            let buf = self.buffers.take(cancel)?;
            let buffers = self.buffers.clone();
            let mut ipm = Ipm::with_callback(buf, self.voice, Tag::PushData, move |buf| {
                buffers.put(buf)
            });
            ipm.set_stream(stream);
            ipm.append_bytes(sample);
            self.outlets
                .push(peer, ipm)
                .map_err(|e| e.trace(format!("forwarding stream {} to voice {}", stream, peer)))?;
        }

        Ok(())
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::Duration;

    use crate::comms::channel::Outbound;

    #[test]
    fn in_flight_samples_are_bounded() {
        let (tx, rx) = mpsc::sync_channel(16);
        let mut outbound = vec![None, None];
        outbound[1] = Some(Outbound::new(1, Some(tx)));
        let outlets = Arc::new(Outlets {
            voice: 0,
            outbound,
            orders: Mutex::new(HashMap::new()),
        });
        let forwarder = Forwarder::new(0, outlets, vec![(1, 3)], 2);
        let cancel = CancelFlag::new();

        forwarder.forward(&[1, 2], &cancel).unwrap();
        forwarder.forward(&[3, 4], &cancel).unwrap();

        // Both buffers are in flight: the next sample waits for a release.
        let blocked = std::thread::spawn({
            let cancel = cancel.clone();
            move || forwarder.forward(&[5, 6], &cancel)
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        let first = rx.recv().unwrap();
        assert_eq!((first.stream(), first.order(), first.body()), (3, 0, &[1u8, 2][..]));
        first.release().unwrap();
        blocked.join().unwrap().unwrap();

        let orders: Vec<_> = rx.try_iter().map(|ipm| ipm.order()).collect();
        assert_eq!(orders, vec![1, 2]);
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let router = StreamRouter::new();
        assert_eq!(
            router.deliver(4, &[0]).unwrap_err().code(),
            ErrorCode::Comms
        );
    }
}
