//! Per-peer link state owned by the connection manager's I/O thread: the
//! non-blocking socket, a single FIFO outbound queue (large messages must
//! not starve small ones — fairness across *peers* comes from mio's
//! round-robin readiness, not from per-peer priority), and the
//! subscription table the remote peer has expressed interest in.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;

use crate::error::Result;
use crate::wire::{Frame, FrameKind};

/// `{network name, message-type tag}` pairs a remote peer has subscribed
/// to. Endpoint id is tracked alongside but does not affect fan-out: a
/// peer that has subscribed to a (network, tag) at all should receive
/// every message of that tag on that network.
pub type SubscriptionKey = (String, u8);

pub struct PeerLink {
  pub remote_name: String,
  pub remote_id: u64,
  pub remote_addr: SocketAddr,
  stream: TcpStream,
  read_buf: BytesMut,
  /// Outbound frames already encoded to bytes, FIFO per peer (large
  /// messages must not starve small ones). Each entry is a `Bytes`, so a
  /// partial write just advances its cursor instead of tracking a separate
  /// offset alongside a `Vec<u8>`.
  write_queue: VecDeque<Bytes>,
  subscriptions: HashSet<SubscriptionKey>,
}

impl PeerLink {
  pub fn new(stream: TcpStream, remote_name: String, remote_id: u64, remote_addr: SocketAddr) -> Self {
    Self {
      remote_name,
      remote_id,
      remote_addr,
      stream,
      read_buf: BytesMut::with_capacity(4096),
      write_queue: VecDeque::new(),
      subscriptions: HashSet::new(),
    }
  }

  pub fn socket(&mut self) -> &mut TcpStream {
    &mut self.stream
  }

  pub fn note_subscription(&mut self, network: String, type_tag: u8) {
    self.subscriptions.insert((network, type_tag));
  }

  pub fn is_subscribed(&self, network: &str, type_tag: u8) -> bool {
    self.subscriptions.contains(&(network.to_owned(), type_tag))
  }

  pub fn enqueue(&mut self, frame: &Frame) -> Result<()> {
    let mut bytes = Vec::new();
    frame.write_to(&mut bytes)?;
    self.write_queue.push_back(Bytes::from(bytes));
    Ok(())
  }

  pub fn has_pending_writes(&self) -> bool {
    !self.write_queue.is_empty()
  }

  /// Flushes as much of the outbound queue as the socket accepts without
  /// blocking. Returns `Ok(true)` once the queue is fully drained.
  pub fn flush(&mut self) -> Result<bool> {
    while let Some(front) = self.write_queue.front_mut() {
      match self.stream.write(front.chunk()) {
        Ok(0) => return Err(crate::error::SilKitError::transport("peer closed during write")),
        Ok(n) => {
          front.advance(n);
          if !front.has_remaining() {
            self.write_queue.pop_front();
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }
    Ok(true)
  }

  /// Reads whatever bytes are currently available and returns every
  /// complete frame that can be parsed out of them. Partial trailing
  /// bytes stay buffered for the next call.
  pub fn read_available_frames(&mut self) -> Result<Vec<Frame>> {
    let mut chunk = [0u8; 8192];
    loop {
      match self.stream.read(&mut chunk) {
        Ok(0) => return Err(crate::error::SilKitError::transport("peer closed connection")),
        Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }
    self.drain_complete_frames()
  }

  fn drain_complete_frames(&mut self) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    loop {
      if self.read_buf.len() < 5 {
        break;
      }
      let length = u32::from_le_bytes([self.read_buf[0], self.read_buf[1], self.read_buf[2], self.read_buf[3]]) as usize;
      if length == 0 {
        return Err(crate::error::SilKitError::protocol("zero-length frame"));
      }
      if self.read_buf.len() < 4 + length {
        break;
      }
      let kind = FrameKind::from_byte(self.read_buf[4])?;
      let mut frame_bytes = self.read_buf.split_to(4 + length);
      frame_bytes.advance(5);
      frames.push(Frame::new(kind, frame_bytes.to_vec()));
    }
    Ok(frames)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn drain_complete_frames_splits_multiple_frames_from_one_read() {
    let mut buf = BytesMut::new();
    let frame_a = Frame::new(FrameKind::ServiceAnnouncement, vec![1, 2]);
    let frame_b = Frame::new(FrameKind::SubscriptionAnnouncement, vec![3]);
    let mut encoded = Vec::new();
    frame_a.write_to(&mut encoded).unwrap();
    frame_b.write_to(&mut encoded).unwrap();
    buf.extend_from_slice(&encoded);

    // Exercise the same splitting logic `drain_complete_frames` uses,
    // without needing a live socket.
    let mut frames = Vec::new();
    loop {
      if buf.len() < 5 {
        break;
      }
      let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
      if buf.len() < 4 + length {
        break;
      }
      let kind = FrameKind::from_byte(buf[4]).unwrap();
      let mut frame_bytes = buf.split_to(4 + length);
      frame_bytes.advance(5);
      frames.push(Frame::new(kind, frame_bytes.to_vec()));
    }
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].payload, vec![1, 2]);
    assert_eq!(frames[1].payload, vec![3]);
  }

  #[test]
  fn drain_complete_frames_rejects_zero_length_frame() {
    let mut read_buf = BytesMut::new();
    read_buf.extend_from_slice(&0u32.to_le_bytes());
    read_buf.extend_from_slice(&[0xFF]);

    let mut link = PeerLink {
      remote_name: "peer".to_owned(),
      remote_id: 0,
      remote_addr: "127.0.0.1:0".parse().unwrap(),
      stream: loopback_stream(),
      read_buf,
      write_queue: VecDeque::new(),
      subscriptions: HashSet::new(),
    };
    assert!(link.drain_complete_frames().is_err());
  }

  fn loopback_stream() -> TcpStream {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let _ = listener.accept().unwrap();
    TcpStream::from_std(client)
  }
}
