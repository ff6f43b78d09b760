//! Buffer relay between the memory BIO and the transport socket.
//!
//! The relay owns the "busy" and EOF bookkeeping for the two transport
//! channels. Starting the actual transport operation (inline on the
//! transport domain, or posted to it) is left to a [`RelayPort`].

use std::task::Poll;

use tlsock_types::NetError;

use crate::bio::MemoryBio;

/// Starts transport operations on behalf of the relay.
///
/// A `Pending` return promises a later call to [`BufferRelay::recv_complete`]
/// or [`BufferRelay::send_complete`] on the engine domain.
pub trait RelayPort {
    fn start_recv(&self, len: usize) -> Poll<Result<Vec<u8>, NetError>>;
    fn start_send(&self, data: Vec<u8>) -> Poll<Result<usize, NetError>>;
}

#[derive(Debug, Default)]
pub struct BufferRelay {
    recv_busy: bool,
    recv_eof: bool,
    send_busy: bool,
}

impl BufferRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_eof(&self) -> bool {
        self.recv_eof
    }

    pub fn is_busy(&self) -> bool {
        self.recv_busy || self.send_busy
    }

    /// Issues one transport read sized to the BIO's free receive space.
    ///
    /// `Ready(Ok(0))` means EOF was observed.
    pub fn recv_step(
        &mut self,
        bio: &mut MemoryBio,
        port: &dyn RelayPort,
    ) -> Poll<Result<usize, NetError>> {
        if self.recv_busy {
            return Poll::Pending;
        }
        let len = bio.read_capacity();
        if len == 0 {
            return Poll::Pending;
        }
        match port.start_recv(len) {
            Poll::Pending => {
                self.recv_busy = true;
                Poll::Pending
            }
            Poll::Ready(result) => Poll::Ready(self.finish_recv(bio, result)),
        }
    }

    /// Records an asynchronous transport read result.
    pub fn recv_complete(
        &mut self,
        bio: &mut MemoryBio,
        result: Result<Vec<u8>, NetError>,
    ) -> Result<usize, NetError> {
        self.recv_busy = false;
        self.finish_recv(bio, result)
    }

    fn finish_recv(
        &mut self,
        bio: &mut MemoryBio,
        result: Result<Vec<u8>, NetError>,
    ) -> Result<usize, NetError> {
        match result {
            Ok(data) => {
                if data.is_empty() {
                    self.recv_eof = true;
                }
                bio.put_read_result(Ok(&data));
                Ok(data.len())
            }
            Err(e) => {
                bio.put_read_result(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Issues one transport write covering both pending BIO regions.
    ///
    /// `Ready(Ok(0))` means there was nothing to send.
    pub fn send_step(
        &mut self,
        bio: &mut MemoryBio,
        port: &dyn RelayPort,
    ) -> Poll<Result<usize, NetError>> {
        if self.send_busy {
            return Poll::Pending;
        }
        let (first, second) = bio.write_regions();
        let len = first.len() + second.len();
        if len == 0 {
            return Poll::Ready(Ok(0));
        }
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(first);
        data.extend_from_slice(second);

        match port.start_send(data) {
            Poll::Pending => {
                self.send_busy = true;
                Poll::Pending
            }
            Poll::Ready(result) => {
                bio.put_write_result(result.clone());
                Poll::Ready(result)
            }
        }
    }

    /// Records an asynchronous transport write result.
    pub fn send_complete(&mut self, bio: &mut MemoryBio, result: Result<usize, NetError>) {
        self.send_busy = false;
        bio.put_write_result(result);
    }

    /// Sends while sends complete synchronously, then tries one receive.
    ///
    /// Returns whether the BIO changed. EOF and transport errors count: the
    /// engine has something new to observe either way.
    pub fn pump(&mut self, bio: &mut MemoryBio, port: &dyn RelayPort) -> bool {
        let mut moved = false;
        loop {
            match self.send_step(bio, port) {
                Poll::Ready(Ok(0)) | Poll::Pending => break,
                Poll::Ready(Ok(_)) => moved = true,
                Poll::Ready(Err(_)) => {
                    moved = true;
                    break;
                }
            }
        }
        if !self.recv_eof && self.recv_step(bio, port).is_ready() {
            moved = true;
        }
        moved
    }
}
