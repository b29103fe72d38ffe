//! Inter-process messages.
//!
//! An [`Ipm`] is a contiguous byte buffer made of a fixed 24-byte header
//! followed by an opaque body. The same buffer is used in memory and on the
//! wire, so a message is written to a socket without re-encoding.
//!
//! Header layout (little-endian):
//!
//! ```text
//!  0        4      6     7     8        12       16             20            24
//!  ┌────────┬──────┬─────┬─────┬────────┬────────┬──────────────┬─────────────┐
//!  │  sig   │voice │ tag │ fmt │ order  │ stream │ uncompressed │ compressed  │
//!  └────────┴──────┴─────┴─────┴────────┴────────┴──────────────┴─────────────┘
//! ```
//!
//! Messages are normally allocated from an [`IpmPool`] and handed back with
//! [`Ipm::release`] once delivered; a message may instead carry a release
//! callback, which is how cross-voice data streams recycle their own
//! buffers.

mod pool;

pub use pool::IpmPool;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Weak;

use crate::error::{Error, ErrorCode};
use crate::params::{VoiceIndex, MAX_VOICES};

use pool::PoolShared;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Magic number at the start of every message ("BRMS").
pub const SIGNATURE: u32 = 0x534D_5242;

/// Compression format of an uncompressed message.
pub const COMPRESSION_NONE: u8 = 0;

const OFFSET_SIGNATURE: usize = 0;
const OFFSET_VOICE: usize = 4;
const OFFSET_TAG: usize = 6;
const OFFSET_FORMAT: usize = 7;
const OFFSET_ORDER: usize = 8;
const OFFSET_STREAM: usize = 12;
const OFFSET_UNCOMPRESSED: usize = 16;
const OFFSET_COMPRESSED: usize = 20;

/// Message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Handshake carrying the voice index and count.
    Hello = 1,
    /// Orderly channel shutdown.
    Goodbye = 2,
    /// The sender failed; the execution must stop.
    Error = 3,
    /// The sender cancelled the execution.
    Cancel = 4,
    /// Synchronization barrier.
    Sync = 5,
    /// Keeps an idle connection alive.
    KeepAlive = 6,
    /// Unsolicited description of a new output (reserved).
    AnnounceOutput = 7,
    /// Connect phase: request for an output of the receiving voice.
    FindOutput = 8,
    /// Connect phase: the requested output exists.
    OutputFound = 9,
    /// Connect phase: the requested output does not exist yet.
    OutputNotFound = 10,
    /// Connect phase: result of a local pass.
    EndPhase = 11,
    /// Rate negotiation: sample rates of a voice.
    PushRates = 12,
    /// Rate negotiation: the negotiated base rate.
    PushBaseRate = 13,
    /// Run phase: one sample of a cross-voice link.
    PushData = 14,
    /// Flow control: consumed sample count (reserved).
    UsedData = 15,
    /// Flow control: buffer state request (reserved).
    QueryBuffer = 16,
}

impl Tag {
    /// Returns the symbolic name of the tag.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Goodbye => "GOODBYE",
            Self::Error => "ERROR",
            Self::Cancel => "CANCEL",
            Self::Sync => "SYNC",
            Self::KeepAlive => "KEEPALIVE",
            Self::AnnounceOutput => "ANNOUNCEOUTPUT",
            Self::FindOutput => "FINDOUTPUT",
            Self::OutputFound => "OUTPUTFOUND",
            Self::OutputNotFound => "OUTPUTNOTFOUND",
            Self::EndPhase => "ENDPHASE",
            Self::PushRates => "PUSHRATES",
            Self::PushBaseRate => "PUSHBASERATE",
            Self::PushData => "PUSHDATA",
            Self::UsedData => "USEDDATA",
            Self::QueryBuffer => "QUERYBUFFER",
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            1 => Self::Hello,
            2 => Self::Goodbye,
            3 => Self::Error,
            4 => Self::Cancel,
            5 => Self::Sync,
            6 => Self::KeepAlive,
            7 => Self::AnnounceOutput,
            8 => Self::FindOutput,
            9 => Self::OutputFound,
            10 => Self::OutputNotFound,
            11 => Self::EndPhase,
            12 => Self::PushRates,
            13 => Self::PushBaseRate,
            14 => Self::PushData,
            15 => Self::UsedData,
            16 => Self::QueryBuffer,
            _ => {
                return Err(Error::new(
                    ErrorCode::Comms,
                    format!("unknown message tag {}", value),
                ))
            }
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callback invoked with the buffer of a released message.
pub type ReleaseFn = Box<dyn FnOnce(Vec<u8>) + Send>;

enum Release {
    Pool(Weak<PoolShared>),
    Callback(ReleaseFn),
    Detached,
}

/// An inter-process message.
pub struct Ipm {
    buf: Vec<u8>,
    release: Release,
}

impl Ipm {
    /// Creates a detached message, which is owned by no pool.
    ///
    /// Detached messages are freed by dropping them; calling
    /// [`release`](Self::release) on them is an error.
    ///
    /// # Panics
    ///
    /// Panics if `source` is not below [`MAX_VOICES`].
    pub fn new(source: VoiceIndex, tag: Tag) -> Self {
        Self::from_buffer(Vec::with_capacity(HEADER_SIZE), source, tag, Release::Detached)
    }

    /// Creates a message in a caller-provided buffer which is handed back to
    /// `callback` on release.
    pub fn with_callback(
        buf: Vec<u8>,
        source: VoiceIndex,
        tag: Tag,
        callback: impl FnOnce(Vec<u8>) + Send + 'static,
    ) -> Self {
        Self::from_buffer(buf, source, tag, Release::Callback(Box::new(callback)))
    }

    pub(crate) fn from_pool(
        buf: Vec<u8>,
        source: VoiceIndex,
        tag: Tag,
        pool: Weak<PoolShared>,
    ) -> Self {
        Self::from_buffer(buf, source, tag, Release::Pool(pool))
    }

    fn from_buffer(mut buf: Vec<u8>, source: VoiceIndex, tag: Tag, release: Release) -> Self {
        buf.clear();
        buf.resize(HEADER_SIZE, 0);
        assert!(
            source < MAX_VOICES,
            "voice index {} does not fit in a message header",
            source
        );
        let mut ipm = Self { buf, release };
        ipm.put_u32(OFFSET_SIGNATURE, SIGNATURE);
        ipm.put_u16(OFFSET_VOICE, source as u16);
        ipm.buf[OFFSET_TAG] = tag as u8;
        ipm.buf[OFFSET_FORMAT] = COMPRESSION_NONE;
        ipm.sync_sizes();

        ipm
    }

    /// Returns the header signature.
    pub fn signature(&self) -> u32 {
        self.get_u32(OFFSET_SIGNATURE)
    }

    /// Returns the index of the voice that created the message.
    pub fn source(&self) -> VoiceIndex {
        self.get_u16(OFFSET_VOICE) as VoiceIndex
    }

    /// Returns the message tag.
    pub fn tag(&self) -> Tag {
        // The tag byte is only ever written from a `Tag` or validated on
        // decoding.
        Tag::try_from(self.buf[OFFSET_TAG]).unwrap_or(Tag::Error)
    }

    /// Returns the compression format.
    pub fn compression(&self) -> u8 {
        self.buf[OFFSET_FORMAT]
    }

    /// Returns the order sequence number.
    pub fn order(&self) -> u32 {
        self.get_u32(OFFSET_ORDER)
    }

    /// Sets the order sequence number.
    pub fn set_order(&mut self, order: u32) {
        self.put_u32(OFFSET_ORDER, order);
    }

    /// Returns the stream identifier.
    pub fn stream(&self) -> u32 {
        self.get_u32(OFFSET_STREAM)
    }

    /// Sets the stream identifier.
    pub fn set_stream(&mut self, stream: u32) {
        self.put_u32(OFFSET_STREAM, stream);
    }

    /// Returns the size of header and body.
    pub fn uncompressed_size(&self) -> usize {
        self.get_u32(OFFSET_UNCOMPRESSED) as usize
    }

    /// Returns the size of the message on the wire.
    pub fn compressed_size(&self) -> usize {
        self.get_u32(OFFSET_COMPRESSED) as usize
    }

    /// Returns the reserved capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Returns the message body.
    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Returns the whole message, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Grows the capacity to at least `n` bytes.
    ///
    /// The capacity never shrinks and the content is preserved.
    pub fn resize(&mut self, n: usize) {
        self.buf.reserve(n.saturating_sub(self.buf.len()));
    }

    /// Grows the capacity to at least `n` bytes, discarding the body.
    ///
    /// This avoids copying the old body when growing. The header is kept, the
    /// body is empty afterwards and the size fields are updated accordingly.
    pub fn resize_discarding(&mut self, n: usize) {
        if n > self.buf.capacity() {
            let mut buf = Vec::with_capacity(n);
            buf.extend_from_slice(&self.buf[..HEADER_SIZE]);
            self.buf = buf;
        } else {
            self.buf.truncate(HEADER_SIZE);
        }
        self.sync_sizes();
    }

    /// Appends raw bytes to the body.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.sync_sizes();
    }

    /// Appends a NUL-terminated string to the body.
    pub fn append_string(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self.sync_sizes();
    }

    /// Appends a little-endian `u32` to the body.
    pub fn append_u32(&mut self, value: u32) {
        self.append_bytes(&value.to_le_bytes());
    }

    /// Appends a little-endian `u64` to the body.
    pub fn append_u64(&mut self, value: u64) {
        self.append_bytes(&value.to_le_bytes());
    }

    /// Returns a reader over the body.
    pub fn reader(&self) -> IpmReader<'_> {
        IpmReader {
            body: self.body(),
            pos: 0,
            tag: self.tag(),
        }
    }

    /// Releases the message to its pool or to its release callback.
    ///
    /// Releasing a detached message is an `E_INTERNAL` error; the buffer is
    /// freed nonetheless. Dropping a message releases it silently.
    pub fn release(mut self) -> Result<(), Error> {
        if matches!(self.release, Release::Detached) {
            return Err(Error::new(
                ErrorCode::Internal,
                "released a message that has neither a pool nor a release callback",
            ));
        }
        self.give_back();

        Ok(())
    }

    fn give_back(&mut self) {
        match std::mem::replace(&mut self.release, Release::Detached) {
            Release::Pool(pool) => {
                if let Some(pool) = pool.upgrade() {
                    pool.recycle(std::mem::take(&mut self.buf));
                }
            }
            Release::Callback(callback) => callback(std::mem::take(&mut self.buf)),
            Release::Detached => {}
        }
    }

    /// Writes the message to a byte stream.
    ///
    /// Messages too large for the 32-bit size fields of the header are
    /// refused with [`io::ErrorKind::InvalidData`].
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        wire_size(self.buf.len())?;
        writer.write_all(&self.buf)
    }

    /// Reads one message from a byte stream into a buffer from `pool`.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly before the first byte.
    pub fn read_from<R: Read>(
        reader: &mut R,
        pool: &IpmPool,
        max_bytes: usize,
    ) -> Result<Option<Ipm>, Error> {
        let mut header = [0u8; HEADER_SIZE];
        match read_exact_or_eof(reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                return Err(Error::new(
                    ErrorCode::Comms,
                    "connection closed in the middle of a message header",
                ))
            }
            _ => {}
        }

        let field = |offset: usize| {
            u32::from_le_bytes([
                header[offset],
                header[offset + 1],
                header[offset + 2],
                header[offset + 3],
            ])
        };
        if field(OFFSET_SIGNATURE) != SIGNATURE {
            return Err(Error::new(ErrorCode::Comms, "bad message signature"));
        }
        let tag = Tag::try_from(header[OFFSET_TAG])?;
        if header[OFFSET_FORMAT] != COMPRESSION_NONE {
            return Err(Error::new(
                ErrorCode::Comms,
                format!("unsupported compression format {}", header[OFFSET_FORMAT]),
            ));
        }
        let uncompressed = field(OFFSET_UNCOMPRESSED) as usize;
        let compressed = field(OFFSET_COMPRESSED) as usize;
        if uncompressed != compressed || uncompressed < HEADER_SIZE {
            return Err(Error::new(
                ErrorCode::Comms,
                format!(
                    "inconsistent message sizes ({} uncompressed, {} compressed)",
                    uncompressed, compressed
                ),
            ));
        }
        if uncompressed > max_bytes {
            return Err(Error::new(
                ErrorCode::Comms,
                format!(
                    "message of {} bytes exceeds the {} bytes limit",
                    uncompressed, max_bytes
                ),
            ));
        }

        // The pooled buffer takes the received header, source voice included.
        let mut ipm = pool.get(tag);
        ipm.buf.clear();
        ipm.buf.extend_from_slice(&header);
        ipm.buf.resize(uncompressed, 0);
        reader
            .read_exact(&mut ipm.buf[HEADER_SIZE..])
            .map_err(|e| Error::from(e).trace("while reading a message body"))?;

        Ok(Some(ipm))
    }

    fn sync_sizes(&mut self) {
        // An oversized message is caught by `write_to`.
        let size = wire_size(self.buf.len()).unwrap_or(u32::MAX);
        self.put_u32(OFFSET_UNCOMPRESSED, size);
        self.put_u32(OFFSET_COMPRESSED, size);
    }

    fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Converts a message length to the value of its header size fields.
fn wire_size(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {} bytes is too large to be sent", len),
        )
    })
}

impl Drop for Ipm {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for Ipm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ipm")
            .field("source", &self.source())
            .field("tag", &self.tag())
            .field("order", &self.order())
            .field("stream", &self.stream())
            .field("size", &self.uncompressed_size())
            .finish_non_exhaustive()
    }
}

/// Reads into `buf` until it is full or the stream ends; returns the number
/// of bytes read.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(filled)
}

/// A cursor over the body of a message.
pub struct IpmReader<'a> {
    body: &'a [u8],
    pos: usize,
    tag: Tag,
}

impl<'a> IpmReader<'a> {
    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.body.len() - self.pos
    }

    /// Reads `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::new(
                ErrorCode::Comms,
                format!("truncated {} message body", self.tag),
            ));
        }
        let bytes = &self.body[self.pos..self.pos + n];
        self.pos += n;

        Ok(bytes)
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str, Error> {
        let rest = &self.body[self.pos..];
        let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::new(
                ErrorCode::Comms,
                format!("unterminated string in {} message", self.tag),
            )
        })?;
        let s = std::str::from_utf8(&rest[..len]).map_err(|_| {
            Error::new(
                ErrorCode::Comms,
                format!("invalid UTF-8 string in {} message", self.tag),
            )
        })?;
        self.pos += len + 1;

        Ok(s)
    }

    /// Fails with `E_COMMS` unless the whole body was consumed.
    pub fn finish(self) -> Result<(), Error> {
        if self.remaining() != 0 {
            return Err(Error::new(
                ErrorCode::Comms,
                format!("{} trailing bytes in {} message", self.remaining(), self.tag),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for IpmReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmReader")
            .field("tag", &self.tag)
            .field("remaining", &self.remaining())
            .finish()
    }
}
