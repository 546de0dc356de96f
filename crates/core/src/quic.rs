//! Transport abstraction, SPEC_FULL.md §6.
//!
//! The core never calls `iroh` directly; it is written against this trait
//! so stream and connection state machines are testable without real
//! sockets. `ClientConnection`/`ServerConnection` elsewhere in this
//! workspace call `iroh::endpoint::Connection` directly; the seam here
//! exists purely because the consumer/producer-facing state machines in
//! this crate are complex enough to warrant unit testing in isolation.

use bytes::Bytes;

use crate::error::{CoreError, Result};

/// One QUIC connection: offers bidirectional/unidirectional stream
/// acceptance and opening, and unreliable datagrams.
pub trait QuicConnection: Send + Sync + 'static {
    type SendStream: QuicSendStream;
    type RecvStream: QuicRecvStream;

    /// Open a new bidirectional stream (used for the initial REQUEST/POST).
    fn open_bi(
        &self,
    ) -> impl std::future::Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;

    /// Accept the next bidirectional stream opened by the peer.
    fn accept_bi(
        &self,
    ) -> impl std::future::Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;

    /// Open a new unidirectional stream (sender side of warp/rush).
    fn open_uni(&self) -> impl std::future::Future<Output = Result<Self::SendStream>> + Send;

    /// Accept the next unidirectional stream opened by the peer.
    fn accept_uni(&self) -> impl std::future::Future<Output = Result<Self::RecvStream>> + Send;

    /// Queue an unreliable datagram.
    fn send_datagram(&self, payload: Bytes) -> Result<()>;

    /// Receive the next unreliable datagram.
    fn read_datagram(&self) -> impl std::future::Future<Output = Result<Bytes>> + Send;

    /// Close the connection with an application error code.
    fn close(&self, error_code: u32, reason: &[u8]);
}

/// The sending half of a QUIC stream.
pub trait QuicSendStream: Send + 'static {
    fn write_all(&mut self, buf: &[u8]) -> impl std::future::Future<Output = Result<()>> + Send;
    fn finish(&mut self) -> Result<()>;
    fn reset(&mut self, error_code: u32);
}

/// The receiving half of a QUIC stream.
pub trait QuicRecvStream: Send + 'static {
    fn read_exact(
        &mut self,
        buf: &mut [u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn stop(&mut self, error_code: u32);
}

/// Adapts `iroh::endpoint` types to the [`QuicConnection`] seam for
/// production use.
pub mod iroh_adapter {
    use super::*;
    use iroh::endpoint::{Connection, RecvStream, SendStream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Clone)]
    pub struct IrohConnection(pub Connection);

    impl QuicConnection for IrohConnection {
        type SendStream = SendStream;
        type RecvStream = RecvStream;

        async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
            self.0
                .open_bi()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
            self.0
                .accept_bi()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        async fn open_uni(&self) -> Result<SendStream> {
            self.0
                .open_uni()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        async fn accept_uni(&self) -> Result<RecvStream> {
            self.0
                .accept_uni()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        fn send_datagram(&self, payload: Bytes) -> Result<()> {
            self.0
                .send_datagram(payload)
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        async fn read_datagram(&self) -> Result<Bytes> {
            self.0
                .read_datagram()
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        fn close(&self, error_code: u32, reason: &[u8]) {
            self.0.close(error_code.into(), reason);
        }
    }

    impl QuicSendStream for SendStream {
        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            AsyncWriteExt::write_all(self, buf)
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        fn finish(&mut self) -> Result<()> {
            SendStream::finish(self).map_err(|e| CoreError::Transport(e.to_string()))
        }

        fn reset(&mut self, error_code: u32) {
            let _ = SendStream::reset(self, error_code.into());
        }
    }

    impl QuicRecvStream for RecvStream {
        async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            AsyncReadExt::read_exact(self, buf)
                .await
                .map(|_| ())
                .map_err(|e| CoreError::Transport(e.to_string()))
        }

        fn stop(&mut self, error_code: u32) {
            let _ = RecvStream::stop(self, error_code.into());
        }
    }
}
