//! Little-endian codec helpers shared by the overlay payloads, the
//! privilege helper frames and the takeover message, plus the socket
//! framing those two protocols have in common.
use std::io::{self, IoSlice, IoSliceMut, Read as _, Write as _};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum WireError {
    #[error("truncated message")]
    Truncated,
    #[error("{0} trailing bytes")]
    TrailingData(usize),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown tag {0}")]
    UnknownTag(u32),
    #[error("malformed field: {0}")]
    Malformed(String),
}

pub struct Writer {
    out: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    /// u16 length prefix + raw bytes.
    pub fn put_len_bytes(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.put_u16(v.len() as u16);
        self.put_bytes(v);
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingData(self.remaining()))
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_len_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }
}

/// Sends one frame: an 8-byte header (body length, message type) followed
/// by the body. File descriptors are attached to the header's sendmsg.
pub fn send_frame(
    stream: &UnixStream,
    msg_type: u32,
    body: &[u8],
    fds: &[RawFd],
) -> io::Result<()> {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[4..].copy_from_slice(&msg_type.to_le_bytes());

    let iov = [IoSlice::new(&header)];
    if fds.is_empty() {
        sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(io::Error::from)?;
    } else {
        let cmsgs = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(io::Error::from)?;
    }

    (&mut &*stream).write_all(body)?;
    Ok(())
}

/// Receives one frame; any passed descriptors arrive with the header.
pub fn recv_frame(stream: &UnixStream) -> io::Result<(u32, Vec<u8>, Vec<OwnedFd>)> {
    let mut header = [0u8; 8];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 8]);
    let mut iov = [IoSliceMut::new(&mut header)];

    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // ownership of received descriptors transfers to us
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the socket",
        ));
    }
    if msg.bytes != header.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short frame header",
        ));
    }

    let body_len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let msg_type = u32::from_le_bytes(header[4..].try_into().unwrap());
    let mut body = vec![0u8; body_len];
    (&mut &*stream).read_exact(&mut body)?;
    Ok((msg_type, body, fds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut w = Writer::new();
        w.put_u8(1);
        w.put_u16(2);
        w.put_u32(3);
        w.put_u64(4);
        w.put_len_bytes(b"hello");
        let data = w.finish();

        let mut r = Reader::new(&data);
        assert_eq!(1, r.read_u8().unwrap());
        assert_eq!(2, r.read_u16().unwrap());
        assert_eq!(3, r.read_u32().unwrap());
        assert_eq!(4, r.read_u64().unwrap());
        assert_eq!(b"hello", r.read_len_bytes().unwrap());
        assert!(r.expect_end().is_ok());
    }

    #[test]
    fn truncation_and_trailing() {
        let mut w = Writer::new();
        w.put_u32(7);
        let data = w.finish();

        let mut r = Reader::new(&data[..2]);
        assert_eq!(Err(WireError::Truncated), r.read_u32());

        let mut r = Reader::new(&data);
        assert_eq!(7, r.read_u32().unwrap());
        r = Reader::new(&data);
        let _ = r.read_u16();
        assert_eq!(Err(WireError::TrailingData(2)), r.expect_end());
    }
}
