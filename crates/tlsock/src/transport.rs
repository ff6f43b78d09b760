//! The underlying stream socket the TLS records travel over.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use tlsock_types::NetError;

use crate::CompletionCallback;

/// Asynchronous, callback-based stream transport.
///
/// Buffers are moved into the operation. When `read` or `write` returns
/// `Pending`, the callback fires exactly once, later, on the transport
/// domain; it is never invoked from inside the call that received it. On a
/// `Ready` return the callback is dropped unused.
pub trait Transport: Send {
    /// Reads up to `len` bytes. An empty buffer means EOF.
    fn read(
        &mut self,
        len: usize,
        callback: CompletionCallback<Vec<u8>>,
    ) -> Poll<Result<Vec<u8>, NetError>>;

    fn write(
        &mut self,
        data: Vec<u8>,
        callback: CompletionCallback<usize>,
    ) -> Poll<Result<usize, NetError>>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Connected, with no unread data and no operation in flight.
    fn is_connected_and_idle(&self) -> bool;

    fn peer_address(&self) -> Result<SocketAddr, NetError>;
}

/// A transport shared between the socket facade and its Core.
pub type SharedTransport = Arc<Mutex<dyn Transport>>;

#[cfg(feature = "tokio")]
pub use self::tokio_stream::TokioTransport;

#[cfg(feature = "tokio")]
mod tokio_stream {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex as AsyncMutex;
    use tlsock_types::TransportError;

    use crate::runner::{TaskRunner, TokioRunner};

    /// [`Transport`] over any tokio byte stream.
    ///
    /// I/O runs as futures on the runner's runtime; completions are posted
    /// back to the runner as tasks.
    pub struct TokioTransport<S> {
        reader: Arc<AsyncMutex<ReadHalf<S>>>,
        writer: Arc<AsyncMutex<WriteHalf<S>>>,
        runner: Arc<TokioRunner>,
        peer: Option<SocketAddr>,
        connected: Arc<AtomicBool>,
        reading: Arc<AtomicBool>,
        writing: Arc<AtomicBool>,
    }

    impl<S> TokioTransport<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        pub fn new(stream: S, runner: Arc<TokioRunner>, peer: Option<SocketAddr>) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                reader: Arc::new(AsyncMutex::new(reader)),
                writer: Arc::new(AsyncMutex::new(writer)),
                runner,
                peer,
                connected: Arc::new(AtomicBool::new(true)),
                reading: Arc::new(AtomicBool::new(false)),
                writing: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    fn transport_error(e: io::Error) -> NetError {
        NetError::Transport(TransportError::from(e))
    }

    impl<S> Transport for TokioTransport<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        fn read(
            &mut self,
            len: usize,
            callback: CompletionCallback<Vec<u8>>,
        ) -> Poll<Result<Vec<u8>, NetError>> {
            if !self.connected.load(Ordering::SeqCst) {
                return Poll::Ready(Err(NetError::SocketNotConnected));
            }
            let reader = Arc::clone(&self.reader);
            let runner = Arc::clone(&self.runner);
            let connected = Arc::clone(&self.connected);
            let reading = Arc::clone(&self.reading);
            reading.store(true, Ordering::SeqCst);

            self.runner.handle().spawn(async move {
                let mut buf = vec![0u8; len];
                let result = reader.lock().await.read(&mut buf).await;
                let result = match result {
                    Ok(n) => {
                        if n == 0 {
                            connected.store(false, Ordering::SeqCst);
                        }
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        Err(transport_error(e))
                    }
                };
                reading.store(false, Ordering::SeqCst);
                runner.post_task(Box::new(move || callback(result)));
            });
            Poll::Pending
        }

        fn write(
            &mut self,
            data: Vec<u8>,
            callback: CompletionCallback<usize>,
        ) -> Poll<Result<usize, NetError>> {
            if !self.connected.load(Ordering::SeqCst) {
                return Poll::Ready(Err(NetError::SocketNotConnected));
            }
            let writer = Arc::clone(&self.writer);
            let runner = Arc::clone(&self.runner);
            let writing = Arc::clone(&self.writing);
            writing.store(true, Ordering::SeqCst);

            self.runner.handle().spawn(async move {
                let mut writer = writer.lock().await;
                let result = match writer.write(&data).await {
                    Ok(n) => writer.flush().await.map(|()| n),
                    Err(e) => Err(e),
                };
                drop(writer);
                writing.store(false, Ordering::SeqCst);
                let result = result.map_err(transport_error);
                runner.post_task(Box::new(move || callback(result)));
            });
            Poll::Pending
        }

        fn disconnect(&mut self) {
            if !self.connected.swap(false, Ordering::SeqCst) {
                return;
            }
            let writer = Arc::clone(&self.writer);
            self.runner.handle().spawn(async move {
                if let Err(e) = writer.lock().await.shutdown().await {
                    log::debug!("transport shutdown failed: {e}");
                }
            });
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_connected_and_idle(&self) -> bool {
            self.is_connected()
                && !self.reading.load(Ordering::SeqCst)
                && !self.writing.load(Ordering::SeqCst)
        }

        fn peer_address(&self) -> Result<SocketAddr, NetError> {
            self.peer.ok_or(NetError::SocketNotConnected)
        }
    }
}
