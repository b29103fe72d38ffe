use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, IpmPool, Tag};
use crate::params::VoiceIndex;
use crate::thread::Thread;

/// The queue feeding messages to a peer.
///
/// For a loopback channel, the queue leads straight to the peer's
/// `Deliverer`; for a socket channel, it leads to the local `Sender` thread.
pub(crate) struct Outbound {
    peer: VoiceIndex,
    queue: Mutex<Option<SyncSender<Ipm>>>,
}

impl Outbound {
    pub(crate) fn new(peer: VoiceIndex, queue: Option<SyncSender<Ipm>>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            queue: Mutex::new(queue),
        })
    }

    /// Queues a message, blocking while the queue is full.
    pub(crate) fn send(&self, ipm: Ipm) -> Result<(), Error> {
        let queue = self.queue.lock().unwrap().clone();
        queue
            .ok_or(())
            .and_then(|q| q.send(ipm).map_err(drop))
            .map_err(|_| {
                Error::new(
                    ErrorCode::Comms,
                    format!("channel to voice {} is closed", self.peer),
                )
            })
    }

    /// Closes the queue; messages already queued are still delivered.
    pub(crate) fn close(&self) {
        self.queue.lock().unwrap().take();
    }
}

/// A connection to one peer and the threads serving it.
pub(crate) struct Channel {
    peer: VoiceIndex,
    outbound: Arc<Outbound>,
    sender: Option<Thread>,
    receiver: Option<Thread>,
    deliverer: Thread,
    socket: Option<TcpStream>,
}

impl Channel {
    pub(crate) fn loopback(peer: VoiceIndex, outbound: Arc<Outbound>, deliverer: Thread) -> Self {
        Self {
            peer,
            outbound,
            sender: None,
            receiver: None,
            deliverer,
            socket: None,
        }
    }

    pub(crate) fn socket(
        peer: VoiceIndex,
        outbound: Arc<Outbound>,
        sender: Thread,
        receiver: Thread,
        deliverer: Thread,
        socket: TcpStream,
    ) -> Self {
        Self {
            peer,
            outbound,
            sender: Some(sender),
            receiver: Some(receiver),
            deliverer,
            socket: Some(socket),
        }
    }

    pub(crate) fn peer(&self) -> VoiceIndex {
        self.peer
    }

    pub(crate) fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    pub(crate) fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.sender
            .iter()
            .chain(self.receiver.iter())
            .chain(std::iter::once(&self.deliverer))
    }

    /// Sends `GOODBYE` outside of any stream ordering, then closes the
    /// outbound queue.
    pub(crate) fn say_goodbye(&self, pool: &IpmPool) {
        if self.outbound.send(pool.get(Tag::Goodbye)).is_err() {
            tracing::debug!("voice {} left before goodbye", self.peer);
        }
        self.outbound.close();
    }

    /// Stops the channel threads.
    ///
    /// The sender flushes its queue first; the write half of the socket is
    /// then shut down so that the peer's receiver sees the end of the
    /// stream, and the local receiver is given the termination timeout to
    /// see the peer's end before the socket is closed entirely.
    pub(crate) fn close(&mut self, timeout: Duration) {
        if let Some(sender) = &mut self.sender {
            sender.terminate(timeout);
        }
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Write);
        }
        if let Some(receiver) = &mut self.receiver {
            receiver.terminate(timeout);
        }
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.deliverer.terminate(timeout);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("socket", &self.socket.is_some())
            .finish_non_exhaustive()
    }
}
