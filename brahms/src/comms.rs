//! Communication between voices.
//!
//! A [`Comms`] object connects the local voice to every other voice of an
//! execution through one channel per peer. Outbound messages are tagged with
//! an order number per peer and stream and queued to the channel. Inbound
//! messages are handed by the channel to a `Deliverer` thread, which restores
//! their order, writes data samples straight into the mirror ring of the
//! stream they belong to, and queues control messages in a per-peer inbox
//! read with [`Comms::pull`].
//!
//! ```text
//!              push                                          pull
//!   voice 0 ──────────► queue ─► Sender ══ TCP ══► Receiver ─► Deliverer ──┬──► inbox ────► voice 1
//!                                                                          └──► mirror rings
//! ```
//!
//! Three kinds of channels are available:
//!
//! * [`Comms::solo`]: a single voice, no channel at all,
//! * [`Comms::loopback`]: several voices within one process, connected by
//!   bounded in-memory queues,
//! * [`Comms::connect_sockets`]: voices connected by TCP streams.
//!
//! A peer that reports an error or cancels the execution aborts the local
//! comms: pending and future pulls fail with the peer's error.

mod channel;
mod deliverer;
mod socket;
mod stream;

pub(crate) use stream::Forwarder;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, IpmPool, Tag};
use crate::params::{ExecParams, VoiceConfig, VoiceIndex, VOICE_MASTER};
use crate::ports::Ring;
use crate::sync::{CancelFlag, WAIT_STEP};
use crate::thread::{Thread, ThreadClass};

use channel::{Channel, Outbound};
use deliverer::Deliverer;
use stream::StreamRouter;

/// Depth of the message queues between threads of a channel.
const QUEUE_DEPTH: usize = 64;

struct InboxState {
    queues: Vec<VecDeque<Ipm>>,
    abort: Option<Error>,
}

/// State shared between a [`Comms`] object and its channel threads.
pub(crate) struct CommsCore {
    inbox: Mutex<InboxState>,
    arrived: Condvar,
    router: StreamRouter,
    closing: AtomicBool,
}

impl CommsCore {
    fn new(count: usize) -> Self {
        Self {
            inbox: Mutex::new(InboxState {
                queues: (0..count).map(|_| VecDeque::new()).collect(),
                abort: None,
            }),
            arrived: Condvar::new(),
            router: StreamRouter::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Queues a control message received from `from`.
    pub(crate) fn post(&self, from: VoiceIndex, ipm: Ipm) {
        let mut inbox = self.inbox.lock().unwrap();
        if let Some(queue) = inbox.queues.get_mut(from) {
            queue.push_back(ipm);
        }
        drop(inbox);
        self.arrived.notify_all();
    }

    /// Aborts communication; the first error is kept.
    pub(crate) fn fail(&self, error: Error) {
        let mut inbox = self.inbox.lock().unwrap();
        if inbox.abort.is_none() {
            tracing::debug!("communication aborted: {}", error);
            inbox.abort = Some(error);
        }
        drop(inbox);
        self.arrived.notify_all();
    }

    pub(crate) fn abort_error(&self) -> Option<Error> {
        self.inbox.lock().unwrap().abort.clone()
    }

    pub(crate) fn router(&self) -> &StreamRouter {
        &self.router
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Outbound side of the channels, shared with data forwarders.
pub(crate) struct Outlets {
    voice: VoiceIndex,
    outbound: Vec<Option<Arc<Outbound>>>,
    orders: Mutex<HashMap<(VoiceIndex, u32), u32>>,
}

impl Outlets {
    /// Stamps a message with the next order number of its stream and queues
    /// it to the channel of `to`.
    pub(crate) fn push(&self, to: VoiceIndex, mut ipm: Ipm) -> Result<(), Error> {
        let outbound = self
            .outbound
            .get(to)
            .and_then(|o| o.as_ref())
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::Internal,
                    format!("voice {} has no channel to voice {}", self.voice, to),
                )
            })?;

        let order = {
            let mut orders = self.orders.lock().unwrap();
            let next = orders.entry((to, ipm.stream())).or_insert(0);
            let order = *next;
            *next = next.wrapping_add(1);
            order
        };
        ipm.set_order(order);

        outbound.send(ipm)
    }
}

/// The communication endpoint of a voice.
pub struct Comms {
    voice: VoiceConfig,
    pool: IpmPool,
    core: Arc<CommsCore>,
    outlets: Arc<Outlets>,
    channels: Vec<Channel>,
    cancel: CancelFlag,
    term_timeout: Duration,
    closed: bool,
}

impl Comms {
    fn with_channels(
        voice: VoiceConfig,
        pool: IpmPool,
        core: Arc<CommsCore>,
        channels: Vec<Channel>,
        params: &ExecParams,
    ) -> Self {
        let mut outbound = vec![None; voice.count];
        for channel in &channels {
            outbound[channel.peer()] = Some(channel.outbound().clone());
        }

        Self {
            voice,
            pool,
            core,
            outlets: Arc::new(Outlets {
                voice: voice.index,
                outbound,
                orders: Mutex::new(HashMap::new()),
            }),
            channels,
            cancel: CancelFlag::new(),
            term_timeout: params.thread_term_timeout,
            closed: false,
        }
    }

    /// Creates the comms of a single-voice execution.
    pub fn solo() -> Self {
        let voice = VoiceConfig::solo();

        Self::with_channels(
            voice,
            IpmPool::new(voice.index),
            Arc::new(CommsCore::new(1)),
            Vec::new(),
            &ExecParams::default(),
        )
    }

    /// Creates the comms of `count` voices running in the same process.
    ///
    /// The returned vector is indexed by voice. Each voice receives the
    /// messages of every peer through its own `Deliverer` thread.
    pub fn loopback(count: usize, params: &ExecParams) -> Result<Vec<Self>, Error> {
        if count == 0 {
            return Err(Error::new(ErrorCode::InvalidArg, "no voice to connect"));
        }

        // queues[to][from]
        let mut senders: Vec<Vec<Option<mpsc::SyncSender<Ipm>>>> =
            (0..count).map(|_| (0..count).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<mpsc::Receiver<Ipm>>>> =
            (0..count).map(|_| (0..count).map(|_| None).collect()).collect();
        for to in 0..count {
            for from in 0..count {
                if to != from {
                    let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
                    senders[to][from] = Some(tx);
                    receivers[to][from] = Some(rx);
                }
            }
        }

        let mut all = Vec::with_capacity(count);
        for index in 0..count {
            let voice = VoiceConfig::new(index, count)?;
            let core = Arc::new(CommsCore::new(count));
            let mut channels = Vec::with_capacity(count - 1);
            for peer in (0..count).filter(|&p| p != index) {
                let outbound = Outbound::new(peer, senders[peer][index].take());
                let inbound = receivers[index][peer].take().ok_or_else(|| {
                    Error::new(ErrorCode::Internal, "loopback queue taken twice")
                })?;

                let mut deliverer =
                    Thread::new(ThreadClass::Deliverer, channels.len() + 1, params.thread_priorities);
                let worker = Deliverer::new(peer, core.clone(), params.reorder_window);
                deliverer.start(params.thread_start_timeout, move |cx| worker.run(cx, inbound))?;

                channels.push(Channel::loopback(peer, outbound, deliverer));
            }
            all.push(Self::with_channels(
                voice,
                IpmPool::new(index),
                core,
                channels,
                params,
            ));
        }
        tracing::debug!("connected {} loopback voices", count);

        Ok(all)
    }

    /// Connects voice `index` to its peers over TCP.
    ///
    /// `peers` holds the listening address of every voice, this one
    /// included, in voice order. Each voice accepts connections from the
    /// higher-indexed voices on `listener` and connects to the lower-indexed
    /// ones, retrying until the comms timeout elapses. Both ends of a
    /// connection exchange a `HELLO` message carrying their voice index and
    /// the voice count.
    pub fn connect_sockets(
        index: VoiceIndex,
        listener: TcpListener,
        peers: &[SocketAddr],
        params: &ExecParams,
    ) -> Result<Self, Error> {
        let voice = VoiceConfig::new(index, peers.len())?;
        let pool = IpmPool::new(index);
        let core = Arc::new(CommsCore::new(voice.count));

        let streams = socket::establish(voice, &listener, peers, &pool, params)?;
        let mut channels = Vec::with_capacity(streams.len());
        for (peer, stream) in streams {
            let ordinal = channels.len() + 1;
            channels.push(socket::open_channel(
                ordinal,
                peer,
                stream,
                pool.clone(),
                core.clone(),
                params,
            )?);
        }
        tracing::debug!(voice = index, "connected to {} peers over TCP", channels.len());

        Ok(Self::with_channels(voice, pool, core, channels, params))
    }

    /// Returns the identity of the local voice.
    pub fn voice(&self) -> VoiceConfig {
        self.voice
    }

    /// Returns the message pool of the local voice.
    pub fn pool(&self) -> &IpmPool {
        &self.pool
    }

    /// Makes blocking operations fail with `E_CANCELLED` once `cancel` is
    /// raised.
    pub fn set_cancel(&mut self, cancel: CancelFlag) {
        self.cancel = cancel;
    }

    /// Sends a message to a peer.
    pub fn push(&self, to: VoiceIndex, ipm: Ipm) -> Result<(), Error> {
        self.outlets.push(to, ipm)
    }

    /// Sends a message with the specified tag and body to every peer.
    pub fn broadcast(&self, tag: Tag, body: &[u8]) -> Result<(), Error> {
        for peer in self.peers() {
            let mut ipm = self.pool.get(tag);
            ipm.append_bytes(body);
            self.push(peer, ipm)?;
        }

        Ok(())
    }

    /// Receives the next control message from a peer.
    ///
    /// Queued messages are returned even after the comms were aborted.
    /// Fails with `E_COMMS_TIMEOUT` if nothing arrives within `timeout`,
    /// with `E_CANCELLED` upon cancellation, or with the abort error.
    pub fn pull(&self, from: VoiceIndex, timeout: Duration) -> Result<Ipm, Error> {
        if from >= self.voice.count || from == self.voice.index {
            return Err(Error::new(
                ErrorCode::Internal,
                format!("voice {} cannot pull from voice {}", self.voice.index, from),
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut inbox = self.core.inbox.lock().unwrap();
        loop {
            if let Some(ipm) = inbox.queues[from].pop_front() {
                return Ok(ipm);
            }
            if let Some(e) = &inbox.abort {
                return Err(e.clone());
            }
            if self.cancel.is_cancelled() {
                return Err(Error::new(ErrorCode::Cancelled, "execution cancelled"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(
                    ErrorCode::CommsTimeout,
                    format!("no message from voice {} within {:?}", from, timeout),
                ));
            }
            inbox = self
                .core
                .arrived
                .wait_timeout(inbox, (deadline - now).min(WAIT_STEP))
                .unwrap()
                .0;
        }
    }

    /// Receives the next control message from a peer, which must carry the
    /// specified tag.
    pub fn pull_tag(&self, from: VoiceIndex, tag: Tag, timeout: Duration) -> Result<Ipm, Error> {
        let ipm = self.pull(from, timeout)?;
        if ipm.tag() != tag {
            return Err(Error::new(
                ErrorCode::Comms,
                format!(
                    "expected {} from voice {} but received {}",
                    tag,
                    from,
                    ipm.tag()
                ),
            ));
        }

        Ok(ipm)
    }

    /// Waits until every voice reached this barrier.
    ///
    /// Peers send `SYNC` to the master, which answers every peer once all of
    /// them arrived. A voice missing the barrier is `E_SYNC_TIMEOUT`.
    pub fn synchronize(&self, timeout: Duration) -> Result<(), Error> {
        if self.voice.count == 1 {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let outcome = if self.voice.is_master() {
            self.peers()
                .try_for_each(|peer| self.pull_tag(peer, Tag::Sync, remaining()).map(drop))
                .and_then(|_| {
                    self.peers()
                        .try_for_each(|peer| self.push(peer, self.pool.get(Tag::Sync)))
                })
        } else {
            self.push(VOICE_MASTER, self.pool.get(Tag::Sync))
                .and_then(|_| self.pull_tag(VOICE_MASTER, Tag::Sync, remaining()).map(drop))
        };

        outcome.map_err(|e| {
            if e.code() == ErrorCode::CommsTimeout {
                Error::new(
                    ErrorCode::SyncTimeout,
                    format!("voices did not synchronize within {:?}", timeout),
                )
            } else {
                e
            }
        })
    }

    /// Returns the error that aborted communication, if any.
    pub fn abort_error(&self) -> Option<Error> {
        self.core.abort_error()
    }

    /// Informs every peer that the local execution failed or was cancelled.
    ///
    /// Delivery is best effort.
    pub(crate) fn notify_abort(&self, error: &Error) {
        let result = if error.code() == ErrorCode::Cancelled {
            self.broadcast(Tag::Cancel, &[])
        } else {
            self.broadcast(Tag::Error, &deliverer::encode_error(error))
        };
        if let Err(e) = result {
            tracing::debug!("could not notify peers of the abort: {}", e);
        }
    }

    /// Routes the data of a stream into a mirror ring.
    pub(crate) fn register_mirror(&self, stream: u32, ring: Arc<Ring>) {
        self.core.router().register(stream, ring);
    }

    /// Creates a forwarder of samples to remote subscribers.
    pub(crate) fn forwarder(&self, targets: Vec<(VoiceIndex, u32)>, buffers: usize) -> Forwarder {
        Forwarder::new(self.voice.index, self.outlets.clone(), targets, buffers)
    }

    /// Returns the channel threads.
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.channels.iter().flat_map(|c| c.threads())
    }

    /// Says goodbye to every peer and stops the channel threads.
    ///
    /// Calling `close` again has no effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.core.closing.store(true, Ordering::Release);

        for channel in &self.channels {
            channel.say_goodbye(&self.pool);
        }
        for channel in &mut self.channels {
            channel.close(self.term_timeout);
        }
        tracing::debug!(voice = self.voice.index, "comms closed");
    }

    fn peers(&self) -> impl Iterator<Item = VoiceIndex> + '_ {
        (0..self.voice.count).filter(move |&v| v != self.voice.index)
    }
}

impl Drop for Comms {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Comms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comms")
            .field("voice", &self.voice)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use std::thread;

    fn params() -> ExecParams {
        ExecParams::default().with_comms_timeout(Duration::from_secs(5))
    }

    #[test]
    fn solo_has_no_peer() {
        let comms = Comms::solo();
        assert_eq!(comms.voice(), VoiceConfig::solo());
        comms.synchronize(Duration::from_millis(10)).unwrap();
        assert_eq!(
            comms.pull(0, Duration::from_millis(10)).unwrap_err().code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn loopback_push_pull() {
        let mut voices = Comms::loopback(2, &params()).unwrap();

        let mut ipm = voices[0].pool().get(Tag::FindOutput);
        ipm.append_string("src>>out");
        voices[0].push(1, ipm).unwrap();

        let received = voices[1].pull(0, Duration::from_secs(5)).unwrap();
        assert_eq!(received.tag(), Tag::FindOutput);
        assert_eq!(received.source(), 0);
        assert_eq!(received.reader().read_string().unwrap(), "src>>out");

        let err = voices[1]
            .pull(0, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommsTimeout);

        voices[1].broadcast(Tag::EndPhase, &[1, 0]).unwrap();
        let err = voices[0]
            .pull_tag(1, Tag::Sync, Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Comms);

        for v in voices.iter_mut() {
            v.close();
        }
    }

    #[test]
    fn loopback_barrier() {
        let voices = Comms::loopback(3, &params()).unwrap();
        let handles: Vec<_> = voices
            .into_iter()
            .map(|comms| thread::spawn(move || comms.synchronize(Duration::from_secs(5))))
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
    }

    #[test]
    fn missing_voice_times_out_barrier() {
        let voices = Comms::loopback(2, &params()).unwrap();
        let err = voices[0]
            .synchronize(Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SyncTimeout);
    }

    #[test]
    fn remote_error_aborts_pulls() {
        let voices = Comms::loopback(2, &params()).unwrap();
        voices[0].notify_abort(&Error::new(ErrorCode::Unrepresentable, "rates overflow"));

        let err = voices[1].pull(0, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unrepresentable);
        assert_eq!(voices[1].abort_error().unwrap().code(), ErrorCode::Unrepresentable);
    }

    #[test]
    fn cancellation_interrupts_pull() {
        let mut voices = Comms::loopback(2, &params()).unwrap();
        let cancel = CancelFlag::new();
        voices[1].set_cancel(cancel.clone());
        cancel.cancel();

        let err = voices[1].pull(0, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }
}
