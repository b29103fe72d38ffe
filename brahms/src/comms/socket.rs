//! TCP channels.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, IpmPool, Tag};
use crate::params::{ExecParams, VoiceConfig, VoiceIndex};
use crate::sync::WAIT_STEP;
use crate::thread::{Thread, ThreadClass, ThreadContext};

use super::channel::{Channel, Outbound};
use super::deliverer::Deliverer;
use super::{CommsCore, QUEUE_DEPTH};

/// Delay between two connection attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Establishes a connection with every peer and exchanges `HELLO`
/// messages.
///
/// Returns the connected streams in voice order.
pub(super) fn establish(
    voice: VoiceConfig,
    listener: &TcpListener,
    peers: &[SocketAddr],
    pool: &IpmPool,
    params: &ExecParams,
) -> Result<Vec<(VoiceIndex, TcpStream)>, Error> {
    let deadline = Instant::now() + params.comms_timeout;
    let mut streams = Vec::with_capacity(voice.count.saturating_sub(1));

    for (peer, addr) in peers.iter().enumerate().take(voice.index) {
        let mut stream = connect_with_retry(peer, *addr, deadline)?;
        stream.set_read_timeout(Some(params.comms_timeout))?;
        send_hello(&mut stream, pool, voice)?;
        let (remote, count) = recv_hello(&mut stream, pool, params.max_message_bytes)?;
        if remote != peer || count != voice.count {
            return Err(Error::new(
                ErrorCode::Comms,
                format!(
                    "expected voice {} of {} at {} but found voice {} of {}",
                    peer, voice.count, addr, remote, count
                ),
            ));
        }
        streams.push((peer, stream));
    }

    listener.set_nonblocking(true)?;
    while streams.len() + 1 < voice.count {
        let mut stream = accept_until(listener, deadline)?;
        stream.set_read_timeout(Some(params.comms_timeout))?;
        let (remote, count) = recv_hello(&mut stream, pool, params.max_message_bytes)?;
        if remote <= voice.index
            || count != voice.count
            || streams.iter().any(|(p, _)| *p == remote)
        {
            return Err(Error::new(
                ErrorCode::Comms,
                format!(
                    "unexpected connection from voice {} of {} (this is voice {} of {})",
                    remote, count, voice.index, voice.count
                ),
            ));
        }
        send_hello(&mut stream, pool, voice)?;
        streams.push((remote, stream));
    }
    listener.set_nonblocking(false)?;

    for (_, stream) in &streams {
        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;
    }
    streams.sort_by_key(|(peer, _)| *peer);

    Ok(streams)
}

fn connect_with_retry(peer: VoiceIndex, addr: SocketAddr, deadline: Instant) -> Result<TcpStream, Error> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = TcpStream::connect_timeout(&addr, remaining.max(RETRY_DELAY));
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::new(
                    ErrorCode::CommsTimeout,
                    format!("could not connect to voice {} at {}: {}", peer, addr, e),
                ))
            }
            Err(_) => spin_sleep::sleep(RETRY_DELAY),
        }
    }
}

fn accept_until(listener: &TcpListener, deadline: Instant) -> Result<TcpStream, Error> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::new(
                        ErrorCode::CommsTimeout,
                        "not all voices connected in time",
                    ));
                }
                spin_sleep::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_hello(stream: &mut TcpStream, pool: &IpmPool, voice: VoiceConfig) -> Result<(), Error> {
    let mut hello = pool.get(Tag::Hello);
    hello.append_u32(voice.index as u32);
    hello.append_u32(voice.count as u32);
    hello.write_to(stream)?;

    Ok(())
}

fn recv_hello(
    stream: &mut TcpStream,
    pool: &IpmPool,
    max_bytes: usize,
) -> Result<(VoiceIndex, usize), Error> {
    let hello = Ipm::read_from(stream, pool, max_bytes)?.ok_or_else(|| {
        Error::new(ErrorCode::Comms, "connection closed before HELLO")
    })?;
    if hello.tag() != Tag::Hello {
        return Err(Error::new(
            ErrorCode::Comms,
            format!("expected HELLO but received {}", hello.tag()),
        ));
    }
    let mut reader = hello.reader();
    let voice = reader.read_u32()? as VoiceIndex;
    let count = reader.read_u32()? as usize;
    reader.finish()?;

    Ok((voice, count))
}

/// Starts the `Sender`, `Receiver` and `Deliverer` threads of a connected
/// stream.
pub(super) fn open_channel(
    ordinal: usize,
    peer: VoiceIndex,
    stream: TcpStream,
    pool: IpmPool,
    core: Arc<CommsCore>,
    params: &ExecParams,
) -> Result<Channel, Error> {
    let (outbound_tx, outbound_rx) = mpsc::sync_channel(QUEUE_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::sync_channel(QUEUE_DEPTH);
    let timeout = params.thread_start_timeout;

    let mut deliverer = Thread::new(ThreadClass::Deliverer, ordinal, params.thread_priorities);
    let worker = Deliverer::new(peer, core.clone(), params.reorder_window);
    deliverer.start(timeout, move |cx| worker.run(cx, inbound_rx))?;

    let mut receiver = Thread::new(ThreadClass::Receiver, ordinal, params.thread_priorities);
    let (read_half, read_pool, read_core) = (stream.try_clone()?, pool.clone(), core.clone());
    let max_bytes = params.max_message_bytes;
    receiver.start(timeout, move |cx| {
        receive_loop(cx, peer, read_half, &read_pool, max_bytes, inbound_tx, &read_core)
    })?;

    let mut sender = Thread::new(ThreadClass::Sender, ordinal, params.thread_priorities);
    let write_half = stream.try_clone()?;
    let keepalive = params.keepalive_interval;
    sender.start(timeout, move |cx| {
        send_loop(cx, peer, write_half, &pool, keepalive, outbound_rx, &core)
    })?;

    Ok(Channel::socket(
        peer,
        Outbound::new(peer, Some(outbound_tx)),
        sender,
        receiver,
        deliverer,
        stream,
    ))
}

fn send_loop(
    cx: &mut ThreadContext,
    peer: VoiceIndex,
    mut stream: TcpStream,
    pool: &IpmPool,
    keepalive: Duration,
    queue: mpsc::Receiver<Ipm>,
    core: &CommsCore,
) {
    let mut last_sent = Instant::now();
    loop {
        cx.still_active();
        let outcome = match queue.recv_timeout(WAIT_STEP) {
            Ok(ipm) => ipm.write_to(&mut stream),
            Err(RecvTimeoutError::Timeout) if last_sent.elapsed() >= keepalive => {
                pool.get(Tag::KeepAlive).write_to(&mut stream)
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = outcome {
            if !core.is_closing() {
                core.fail(Error::from(e).trace(format!("in channel to voice {}", peer)));
            }
            break;
        }
        last_sent = Instant::now();
    }
    let _ = stream.flush();
}

fn receive_loop(
    cx: &mut ThreadContext,
    peer: VoiceIndex,
    mut stream: TcpStream,
    pool: &IpmPool,
    max_bytes: usize,
    deliverer: SyncSender<Ipm>,
    core: &CommsCore,
) {
    let mut goodbye = false;
    loop {
        cx.still_active();
        match Ipm::read_from(&mut stream, pool, max_bytes) {
            Ok(Some(ipm)) => {
                goodbye |= ipm.tag() == Tag::Goodbye;
                if deliverer.send(ipm).is_err() {
                    break;
                }
            }
            Ok(None) => {
                if !goodbye && !core.is_closing() {
                    core.fail(Error::new(
                        ErrorCode::Comms,
                        format!("voice {} closed the connection unexpectedly", peer),
                    ));
                }
                break;
            }
            Err(e) => {
                if !core.is_closing() {
                    core.fail(e.trace(format!("in channel from voice {}", peer)));
                }
                break;
            }
        }
    }
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::super::Comms;
    use super::*;

    use std::thread;

    fn listeners(count: usize) -> (Vec<TcpListener>, Vec<SocketAddr>) {
        let listeners: Vec<_> = (0..count)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let addrs = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        (listeners, addrs)
    }

    #[test]
    fn three_voices_over_tcp() {
        let (listeners, addrs) = listeners(3);
        let params = ExecParams::default().with_comms_timeout(Duration::from_secs(10));

        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| {
                let addrs = addrs.clone();
                let params = params.clone();
                thread::spawn(move || {
                    let mut comms = Comms::connect_sockets(index, listener, &addrs, &params)?;
                    comms.synchronize(Duration::from_secs(10))?;

                    let next = (index + 1) % 3;
                    let prev = (index + 2) % 3;
                    let mut ipm = comms.pool().get(Tag::FindOutput);
                    ipm.append_u32(index as u32);
                    comms.push(next, ipm)?;
                    let received = comms.pull_tag(prev, Tag::FindOutput, Duration::from_secs(10))?;
                    let from = received.reader().read_u32()?;

                    comms.synchronize(Duration::from_secs(10))?;
                    comms.close();

                    Ok::<_, Error>((from as usize, prev, comms.abort_error()))
                })
            })
            .collect();

        for h in handles {
            let (from, prev, abort) = h.join().unwrap().unwrap();
            assert_eq!(from, prev);
            assert!(abort.is_none());
        }
    }

    #[test]
    fn mismatched_voice_count_is_rejected() {
        let (mut listeners, addrs) = listeners(2);
        let params = ExecParams::default().with_comms_timeout(Duration::from_secs(5));

        let l1 = listeners.pop().unwrap();
        let l0 = listeners.pop().unwrap();
        let other = {
            let addrs = addrs.clone();
            let params = params.clone();
            thread::spawn(move || {
                // Voice 1 believes there are three voices.
                let mut wrong = addrs.clone();
                wrong.push(addrs[0]);
                Comms::connect_sockets(1, l1, &wrong, &params).map(drop)
            })
        };

        let err = Comms::connect_sockets(0, l0, &addrs, &params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Comms);
        assert!(other.join().unwrap().is_err());
    }
}
