/// Growable I/O buffer with MySQL packet framing
///
/// A `Buffer` is driven by non-blocking `try_read`/`try_write` calls. Each
/// call makes as much progress as the socket allows and reports either
/// `Progress::Done` or `Progress::Pending`; the caller awaits readiness and
/// calls again. A zero-byte read or write means the peer went away.
use super::{read_header, write_header, MAX_PAYLOAD_LEN};
use crate::error::{ProtocolError, ProxyError, ProxyResult};
use std::io;
use tokio::net::TcpStream;

/// Default buffer capacity
pub const PREALLOC_SIZE: usize = 64 * 1024;
/// Packet header: 3-byte length + 1-byte sequence
pub const HEADER_SIZE: usize = 4;

/// Outcome of one non-blocking buffer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The packet (or write) is complete
    Done,
    /// The socket would block; wait for readiness and retry
    Pending,
}

/// Non-blocking socket operations the buffer needs
pub trait TryIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl TryIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Byte buffer with a used length and a read/write cursor.
///
/// Invariant: `cursor <= used <= capacity` after every operation.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    used: usize,
    pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; PREALLOC_SIZE],
            used: 0,
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn cursor(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Whether the buffer has outgrown its default storage
    pub fn is_grown(&self) -> bool {
        self.data.len() > PREALLOC_SIZE
    }

    /// All accumulated bytes, header included
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Payload of the framed packet at the start of the buffer
    pub fn payload(&self) -> &[u8] {
        if self.used < HEADER_SIZE {
            return &[];
        }
        let (len, _) = read_header(&self.data);
        let end = (HEADER_SIZE + len).min(self.used);
        &self.data[HEADER_SIZE..end]
    }

    /// Sequence number of the framed packet at the start of the buffer
    pub fn seq(&self) -> Option<u8> {
        (self.used >= HEADER_SIZE).then(|| self.data[3])
    }

    /// Drop any grown storage and clear the buffer
    pub fn reset(&mut self) {
        if self.is_grown() {
            self.data = vec![0; PREALLOC_SIZE];
        }
        self.used = 0;
        self.pos = 0;
    }

    /// Move the cursor back to the start, typically before writing out
    /// what was just read
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Grow to at least `size` bytes, preserving accumulated bytes
    pub fn grow(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
    }

    /// Replace the contents with one framed packet. Payloads that do not
    /// fit the 3-byte length are refused.
    pub fn load_packet(&mut self, seq: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::TooLarge { len: payload.len() });
        }
        self.reset();
        let total = HEADER_SIZE + payload.len();
        self.grow(total);
        write_header(&mut self.data, payload.len(), seq);
        self.data[HEADER_SIZE..total].copy_from_slice(payload);
        self.used = total;
        Ok(())
    }

    /// Accumulate one framed packet.
    ///
    /// Completes once the header plus the announced payload length has been
    /// buffered; grows the storage when the packet does not fit.
    pub fn read_packet<R: TryIo + ?Sized>(&mut self, io: &R) -> ProxyResult<Progress> {
        loop {
            if let Some(total) = self.packet_len() {
                if total > self.data.len() {
                    self.grow(total);
                }
                if self.used >= total {
                    return Ok(Progress::Done);
                }
            }

            match io.try_read(&mut self.data[self.used..]) {
                Ok(0) => return Err(ProxyError::PeerClosed),
                Ok(n) => {
                    self.used += n;
                    self.pos += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read whatever is available without framing, up to the free space.
    ///
    /// Returns `Done` once at least one byte has been read; a peer shutdown
    /// with nothing buffered is an error.
    pub fn read_available<R: TryIo + ?Sized>(&mut self, io: &R) -> ProxyResult<Progress> {
        let start = self.used;
        while self.used < self.data.len() {
            match io.try_read(&mut self.data[self.used..]) {
                Ok(0) if self.used == start => return Err(ProxyError::PeerClosed),
                Ok(0) => break,
                Ok(n) => {
                    self.used += n;
                    self.pos += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if self.used > start {
            Ok(Progress::Done)
        } else {
            Ok(Progress::Pending)
        }
    }

    /// Drain bytes from the cursor up to the used length
    pub fn write<W: TryIo + ?Sized>(&mut self, io: &W) -> ProxyResult<Progress> {
        while self.pos < self.used {
            match io.try_write(&self.data[self.pos..self.used]) {
                Ok(0) => return Err(ProxyError::PeerClosed),
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Progress::Done)
    }

    fn packet_len(&self) -> Option<usize> {
        if self.used < HEADER_SIZE {
            return None;
        }
        let (len, _) = read_header(&self.data);
        Some(HEADER_SIZE + len)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Scripted socket: each read step yields a chunk, `WouldBlock`, or EOF;
    /// writes accept at most `write_limit` bytes per call.
    pub(crate) struct ScriptedIo {
        reads: RefCell<VecDeque<Option<Vec<u8>>>>,
        pub written: RefCell<Vec<u8>>,
        write_limit: usize,
        block_every_other_write: RefCell<bool>,
    }

    impl ScriptedIo {
        pub fn new(reads: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                reads: RefCell::new(reads.into()),
                written: RefCell::new(Vec::new()),
                write_limit: usize::MAX,
                block_every_other_write: RefCell::new(false),
            }
        }

        pub fn with_write_limit(mut self, limit: usize) -> Self {
            self.write_limit = limit;
            self
        }
    }

    impl TryIo for ScriptedIo {
        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut reads = self.reads.borrow_mut();
            match reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(None) => Ok(0),
                Some(Some(chunk)) if chunk.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        reads.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let mut toggle = self.block_every_other_write.borrow_mut();
            *toggle = !*toggle;
            if !*toggle && self.write_limit != usize::MAX {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_limit);
            self.written.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    fn framed(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE];
        write_header(&mut out, payload.len(), seq);
        out.extend_from_slice(payload);
        out
    }

    fn assert_invariant(buf: &Buffer) {
        assert!(buf.cursor() <= buf.used());
        assert!(buf.used() <= buf.capacity());
    }

    #[test]
    fn test_read_packet_in_fragments() {
        let packet = framed(0, b"\x03select 1");
        let io = ScriptedIo::new(vec![
            Some(packet[..2].to_vec()),
            Some(Vec::new()),
            Some(packet[2..7].to_vec()),
            Some(packet[7..].to_vec()),
        ]);
        let mut buf = Buffer::new();

        assert_eq!(buf.read_packet(&io).unwrap(), Progress::Pending);
        assert_invariant(&buf);
        assert_eq!(buf.used(), 2);

        assert_eq!(buf.read_packet(&io).unwrap(), Progress::Done);
        assert_invariant(&buf);
        assert_eq!(buf.payload(), b"\x03select 1");
        assert_eq!(buf.seq(), Some(0));
    }

    #[test]
    fn test_read_packet_grows_past_default_capacity() {
        let payload = vec![b'x'; PREALLOC_SIZE + 100];
        let packet = framed(3, &payload);
        let io = ScriptedIo::new(vec![Some(packet.clone())]);
        let mut buf = Buffer::new();

        assert_eq!(buf.read_packet(&io).unwrap(), Progress::Done);
        assert_invariant(&buf);
        assert!(buf.is_grown());
        assert_eq!(buf.used(), packet.len());
        assert_eq!(buf.payload(), payload.as_slice());

        buf.reset();
        assert_invariant(&buf);
        assert_eq!(buf.capacity(), PREALLOC_SIZE);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_packet_peer_closed() {
        let io = ScriptedIo::new(vec![Some(vec![5, 0]), None]);
        let mut buf = Buffer::new();
        let err = buf.read_packet(&io).unwrap_err();
        assert!(matches!(err, ProxyError::PeerClosed));
        assert_eq!(buf.used(), 2);
        assert_invariant(&buf);
    }

    #[test]
    fn test_grow_preserves_bytes() {
        let mut buf = Buffer::new();
        buf.load_packet(1, b"hello").unwrap();
        buf.grow(PREALLOC_SIZE * 2);
        assert_invariant(&buf);
        assert_eq!(buf.payload(), b"hello");
        assert_eq!(buf.capacity(), PREALLOC_SIZE * 2);
    }

    #[test]
    fn test_load_packet_rejects_oversized_payload() {
        let mut buf = Buffer::new();
        buf.load_packet(3, b"kept").unwrap();

        let huge = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let err = buf.load_packet(0, &huge).unwrap_err();
        assert_eq!(err, ProtocolError::TooLarge { len: MAX_PAYLOAD_LEN + 1 });
        assert_eq!(buf.payload(), b"kept");
        assert_invariant(&buf);
    }

    #[test]
    fn test_partial_writes() {
        let mut buf = Buffer::new();
        buf.load_packet(0, b"abcdefghij").unwrap();
        let io = ScriptedIo::new(Vec::new()).with_write_limit(3);

        let mut rounds = 0;
        while buf.write(&io).unwrap() == Progress::Pending {
            assert_invariant(&buf);
            rounds += 1;
        }
        assert!(rounds > 0);
        assert_eq!(buf.cursor(), buf.used());
        assert_eq!(io.written.borrow().as_slice(), buf.as_slice());
    }

    #[test]
    fn test_read_available_is_unframed() {
        let io = ScriptedIo::new(vec![Some(b"opaque".to_vec()), Some(b" bytes".to_vec())]);
        let mut buf = Buffer::new();
        assert_eq!(buf.read_available(&io).unwrap(), Progress::Done);
        assert_eq!(buf.as_slice(), b"opaque bytes");
        assert_eq!(buf.read_available(&io).unwrap(), Progress::Pending);

        let closed = ScriptedIo::new(vec![None]);
        let mut buf = Buffer::new();
        assert!(matches!(
            buf.read_available(&closed),
            Err(ProxyError::PeerClosed)
        ));
    }

    #[test]
    fn test_rewind_then_write_echoes_read() {
        let packet = framed(0, b"\x0e");
        let io = ScriptedIo::new(vec![Some(packet.clone())]);
        let mut buf = Buffer::new();
        buf.read_packet(&io).unwrap();
        assert_eq!(buf.cursor(), buf.used());

        buf.rewind();
        assert_eq!(buf.write(&io).unwrap(), Progress::Done);
        assert_eq!(io.written.borrow().as_slice(), packet.as_slice());
    }
}
