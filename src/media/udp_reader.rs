use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use enclose::enc;
use tokio::{
    io::{AsyncRead, ReadBuf},
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 2048;
const MAX_DATAGRAM_SIZE: usize = 65535;

/// UdpPacketReader pumps datagrams from a local UDP socket into a bounded queue on a background task.
/// Each read hands out exactly one datagram. When the queue is full the newest datagram is dropped.
#[derive(Debug)]
pub struct UdpPacketReader {
    local_addr: SocketAddr,
    receiver: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl UdpPacketReader {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        Self::with_capacity(addr, DEFAULT_QUEUE_CAPACITY).await
    }

    pub async fn with_capacity<A: ToSocketAddrs>(addr: A, capacity: usize) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();

        tokio::spawn(enc!((closed) async move {
            Self::receive_loop(socket, sender, closed).await;
        }));

        tracing::debug!("UdpPacketReader is listening on {}", local_addr);

        Ok(Self {
            local_addr,
            receiver,
            closed,
        })
    }

    async fn receive_loop(socket: UdpSocket, sender: mpsc::Sender<Bytes>, closed: CancellationToken) {
        let local_addr = socket.local_addr().ok();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut dropped: u64 = 0;
        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    break;
                }
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, _from)) => {
                            match sender.try_send(Bytes::copy_from_slice(&buf[..n])) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    dropped += 1;
                                    tracing::warn!("UdpPacketReader queue is full, dropped={}", dropped);
                                }
                                Err(TrySendError::Closed(_)) => {
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!("UdpPacketReader failed to receive: {}", err);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("UdpPacketReader {:?} receive loop has finished", local_addr);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the background pump. Pending and later reads return end of stream. Safe to call repeatedly.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// A handle that closes this reader from another task.
    pub fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl AsyncRead for UdpPacketReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let n = packet.len().min(buf.remaining());
                if n < packet.len() {
                    tracing::warn!(
                        "UdpPacketReader truncated datagram from {} to {} bytes",
                        packet.len(),
                        n
                    );
                }
                buf.put_slice(&packet[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for UdpPacketReader {
    fn drop(&mut self) {
        self.closed.cancel();
        tracing::debug!("UdpPacketReader {} is dropped", self.local_addr);
    }
}
