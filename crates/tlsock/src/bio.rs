//! In-memory I/O layer between the engine and the buffer relay.
//!
//! The engine only ever sees this buffer pair. It reads ciphertext the relay
//! has received and writes ciphertext the relay will send, and learns about
//! transport failures or EOF through the same calls.

use std::collections::VecDeque;

use tlsock_types::{EngineError, NetError};

/// Default receive buffer size.
pub const RECV_BUFFER_SIZE: usize = 4096;
/// Default send buffer size.
pub const SEND_BUFFER_SIZE: usize = 16384;

/// Paired receive and send ring buffers.
#[derive(Debug)]
pub struct MemoryBio {
    recv: VecDeque<u8>,
    recv_capacity: usize,
    recv_eof: bool,
    recv_error: Option<NetError>,
    send: VecDeque<u8>,
    send_capacity: usize,
    send_error: Option<NetError>,
}

impl Default for MemoryBio {
    fn default() -> Self {
        Self::new(RECV_BUFFER_SIZE, SEND_BUFFER_SIZE)
    }
}

impl MemoryBio {
    pub fn new(recv_capacity: usize, send_capacity: usize) -> Self {
        Self {
            recv: VecDeque::with_capacity(recv_capacity),
            recv_capacity,
            recv_eof: false,
            recv_error: None,
            send: VecDeque::with_capacity(send_capacity),
            send_capacity,
            send_error: None,
        }
    }

    // -----------------------------------------------------------------------
    // Transport side
    // -----------------------------------------------------------------------

    /// Free space in the receive buffer; the size of the next transport read.
    pub fn read_capacity(&self) -> usize {
        if self.recv_eof || self.recv_error.is_some() {
            return 0;
        }
        self.recv_capacity.saturating_sub(self.recv.len())
    }

    /// Records the outcome of a transport read. Empty data is EOF.
    pub fn put_read_result(&mut self, result: Result<&[u8], NetError>) {
        match result {
            Ok([]) => self.recv_eof = true,
            Ok(data) => self.recv.extend(data),
            Err(e) => self.recv_error = Some(e),
        }
    }

    /// Pending outbound bytes as up to two contiguous regions.
    pub fn write_regions(&self) -> (&[u8], &[u8]) {
        self.send.as_slices()
    }

    pub fn pending_send(&self) -> usize {
        self.send.len()
    }

    /// Records the outcome of a transport write of `write_regions` bytes.
    pub fn put_write_result(&mut self, result: Result<usize, NetError>) {
        match result {
            Ok(n) => {
                let n = n.min(self.send.len());
                self.send.drain(..n);
            }
            Err(e) => {
                self.send.clear();
                self.send_error = Some(e);
            }
        }
    }

    pub fn is_eof(&self) -> bool {
        self.recv_eof
    }

    // -----------------------------------------------------------------------
    // Engine side
    // -----------------------------------------------------------------------

    /// Bytes buffered for the engine to consume.
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    /// Copies received bytes into `out`.
    ///
    /// `Ok(0)` means the transport reached EOF and all buffered bytes were
    /// consumed. A stored transport failure is returned on every call once
    /// the buffer has drained.
    pub fn engine_read(&mut self, out: &mut [u8]) -> Result<usize, EngineError> {
        if !self.recv.is_empty() {
            let n = out.len().min(self.recv.len());
            for (dst, src) in out.iter_mut().zip(self.recv.drain(..n)) {
                *dst = src;
            }
            return Ok(n);
        }
        if let Some(e) = &self.recv_error {
            return Err(EngineError::Io(e.clone()));
        }
        if self.recv_eof {
            return Ok(0);
        }
        Err(EngineError::WouldBlock)
    }

    pub fn free_send_space(&self) -> usize {
        self.send_capacity.saturating_sub(self.send.len())
    }

    /// Queues bytes for the transport, accepting as many as fit.
    pub fn engine_write(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        if let Some(e) = &self.send_error {
            return Err(EngineError::Io(e.clone()));
        }
        let n = data.len().min(self.free_send_space());
        if n == 0 && !data.is_empty() {
            return Err(EngineError::WouldBlock);
        }
        self.send.extend(&data[..n]);
        Ok(n)
    }

    /// Drops buffered data and sticky state for a fresh connection attempt.
    pub fn reset(&mut self) {
        self.recv.clear();
        self.recv_eof = false;
        self.recv_error = None;
        self.send.clear();
        self.send_error = None;
    }
}
