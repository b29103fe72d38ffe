use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;

use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, Tag};
use crate::params::VoiceIndex;
use crate::sync::WAIT_STEP;
use crate::thread::ThreadContext;

use super::CommsCore;

/// Encodes an error as the body of an `ERROR` message.
pub(super) fn encode_error(error: &Error) -> Vec<u8> {
    let mut body = Vec::new();
    for s in [error.code().symbol(), error.message()] {
        body.extend_from_slice(s.as_bytes());
        body.push(0);
    }

    body
}

fn decode_error(ipm: &Ipm, peer: VoiceIndex) -> Result<Error, Error> {
    let mut reader = ipm.reader();
    let symbol = reader.read_string()?;
    let message = reader.read_string()?;
    reader.finish()?;
    let code = ErrorCode::from_symbol(symbol).unwrap_or(ErrorCode::Comms);

    Ok(Error::new(code, message).trace(format!("raised on voice {}", peer)))
}

/// Dispatcher of the messages received from one peer.
///
/// Messages of each stream are dispatched in order. A message that arrives
/// early is held back until its predecessors arrived, provided it is less
/// than `window` messages ahead; a message that is stale, duplicated or too
/// far ahead is `E_OUT_OF_ORDER_DELIVERY`.
pub(super) struct Deliverer {
    peer: VoiceIndex,
    core: Arc<CommsCore>,
    window: u32,
    expected: HashMap<u32, u32>,
    early: HashMap<u32, BTreeMap<u32, Ipm>>,
}

impl Deliverer {
    pub(super) fn new(peer: VoiceIndex, core: Arc<CommsCore>, window: usize) -> Self {
        Self {
            peer,
            core,
            window: u32::try_from(window).unwrap_or(u32::MAX).max(1),
            expected: HashMap::new(),
            early: HashMap::new(),
        }
    }

    /// Thread procedure: dispatches messages until the queue is closed, or
    /// until the comms are closing and the queue is idle.
    pub(super) fn run(mut self, cx: &mut ThreadContext, queue: Receiver<Ipm>) {
        loop {
            cx.still_active();
            match queue.recv_timeout(WAIT_STEP) {
                Ok(ipm) => {
                    if let Err(e) = self.accept(ipm) {
                        if !self.core.is_closing() {
                            self.core
                                .fail(e.trace(format!("in channel from voice {}", self.peer)));
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.core.is_closing() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Accepts a received message.
    pub(super) fn accept(&mut self, ipm: Ipm) -> Result<(), Error> {
        match ipm.tag() {
            Tag::KeepAlive | Tag::Hello => return Ok(()),
            Tag::Goodbye => {
                tracing::debug!("voice {} said goodbye", self.peer);
                return Ok(());
            }
            _ => {}
        }

        let stream = ipm.stream();
        let order = ipm.order();
        let mut next = self.expected.get(&stream).copied().unwrap_or(0);
        // Order numbers wrap around; anything in the half-range behind `next`
        // has already been delivered.
        let ahead = order.wrapping_sub(next);
        if ahead > u32::MAX / 2 {
            return Err(out_of_order(format!(
                "stale message {} on stream {} (expected {})",
                order, stream, next
            )));
        }
        if ahead >= self.window {
            return Err(out_of_order(format!(
                "message {} on stream {} is more than {} messages ahead of {}",
                order, stream, self.window, next
            )));
        }
        if ahead > 0 {
            if self.early.entry(stream).or_default().insert(order, ipm).is_some() {
                return Err(out_of_order(format!(
                    "duplicate message {} on stream {}",
                    order, stream
                )));
            }
            return Ok(());
        }

        self.dispatch(ipm)?;
        next = next.wrapping_add(1);
        while let Some(ipm) = self
            .early
            .get_mut(&stream)
            .and_then(|held| held.remove(&next))
        {
            self.dispatch(ipm)?;
            next = next.wrapping_add(1);
        }
        self.expected.insert(stream, next);

        Ok(())
    }

    fn dispatch(&self, ipm: Ipm) -> Result<(), Error> {
        match ipm.tag() {
            Tag::Cancel => self.core.fail(Error::new(
                ErrorCode::Cancelled,
                format!("execution cancelled by voice {}", self.peer),
            )),
            Tag::Error => self.core.fail(decode_error(&ipm, self.peer)?),
            Tag::PushData => self.core.router().deliver(ipm.stream(), ipm.body())?,
            _ => self.core.post(self.peer, ipm),
        }

        Ok(())
    }
}

fn out_of_order(message: String) -> Error {
    Error::new(ErrorCode::OutOfOrderDelivery, message)
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use crate::ipm::IpmPool;
    use crate::ports::RingBuilder;

    fn message(pool: &IpmPool, stream: u32, order: u32, tag: Tag) -> Ipm {
        let mut ipm = pool.get(tag);
        ipm.set_stream(stream);
        ipm.set_order(order);
        ipm.append_u32(order);
        ipm
    }

    fn inbox_orders(core: &CommsCore, from: VoiceIndex) -> Vec<u32> {
        core.inbox.lock().unwrap().queues[from]
            .iter()
            .map(|ipm| ipm.order())
            .collect()
    }

    #[test]
    fn early_messages_are_held_back() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut deliverer = Deliverer::new(1, core.clone(), 4);

        for order in [2, 0, 3, 1] {
            deliverer
                .accept(message(&pool, 0, order, Tag::FindOutput))
                .unwrap();
        }
        deliverer
            .accept(message(&pool, 7, 0, Tag::OutputFound))
            .unwrap();

        assert_eq!(inbox_orders(&core, 1), vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn stale_and_distant_messages_are_rejected() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut deliverer = Deliverer::new(1, core, 4);

        deliverer.accept(message(&pool, 0, 0, Tag::Sync)).unwrap();
        let err = deliverer.accept(message(&pool, 0, 0, Tag::Sync)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfOrderDelivery);

        let err = deliverer.accept(message(&pool, 0, 5, Tag::Sync)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfOrderDelivery);

        deliverer.accept(message(&pool, 0, 3, Tag::Sync)).unwrap();
        let err = deliverer.accept(message(&pool, 0, 3, Tag::Sync)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfOrderDelivery);
    }

    #[test]
    fn keepalives_bypass_ordering() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut deliverer = Deliverer::new(1, core.clone(), 4);

        for _ in 0..3 {
            deliverer.accept(message(&pool, 0, 0, Tag::KeepAlive)).unwrap();
        }
        assert!(inbox_orders(&core, 1).is_empty());
    }

    #[test]
    fn data_reaches_mirror_ring() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut builder = RingBuilder::new(4, 1);
        let reader = builder.add_reader(1, 1);
        let ring = builder.build();
        core.router().register(9, ring.clone());

        let mut deliverer = Deliverer::new(1, core, 4);
        deliverer
            .accept(message(&pool, 9, 0, Tag::PushData))
            .unwrap();

        let guard = ring.read(reader, 0).unwrap();
        assert_eq!(guard.bytes(), &0u32.to_le_bytes());
    }

    #[test]
    fn remote_error_is_decoded() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut deliverer = Deliverer::new(1, core.clone(), 4);

        let mut ipm = pool.get(Tag::Error);
        ipm.append_bytes(&encode_error(&Error::new(ErrorCode::Deadlock, "stuck")));
        deliverer.accept(ipm).unwrap();

        let err = core.abort_error().unwrap();
        assert_eq!(err.code(), ErrorCode::Deadlock);
        assert_eq!(err.message(), "stuck");
        assert_eq!(err.trace_lines(), &["raised on voice 1".to_string()]);
    }

    #[test]
    fn order_numbers_wrap_around() {
        let core = Arc::new(CommsCore::new(2));
        let pool = IpmPool::new(1);
        let mut deliverer = Deliverer::new(1, core.clone(), 4);
        deliverer.expected.insert(0, u32::MAX - 1);

        // Held back across the wrap, then released in order.
        deliverer.accept(message(&pool, 0, 0, Tag::Sync)).unwrap();
        deliverer.accept(message(&pool, 0, u32::MAX - 1, Tag::Sync)).unwrap();
        deliverer.accept(message(&pool, 0, u32::MAX, Tag::Sync)).unwrap();
        deliverer.accept(message(&pool, 0, 1, Tag::Sync)).unwrap();
        assert_eq!(inbox_orders(&core, 1), vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(deliverer.expected[&0], 2);

        let err = deliverer.accept(message(&pool, 0, u32::MAX, Tag::Sync)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfOrderDelivery);
        assert!(err.message().starts_with("stale"));

        let err = deliverer.accept(message(&pool, 0, 6, Tag::Sync)).unwrap_err();
        assert!(err.message().contains("ahead"));
    }
}
