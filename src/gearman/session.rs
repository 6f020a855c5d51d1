// SPDX-License-Identifier: AGPL-3.0-or-later

//! A single TCP connection to one Gearman job server: framing, solicited
//! request/response correlation, and unsolicited-command fan-out.

use std::{collections::VecDeque, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::gearman::{
    codec::{CodecError, Frame, FrameDecoder},
    constants::Command,
};

/// A callback invoked for every unsolicited frame (NOOP, WORK_* pushes)
/// that arrives on this session, in arrival order.
pub type UnsolicitedHandler = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to job server at {0}: {1}")]
    Connect(SocketAddr, #[source] std::io::Error),
    #[error("i/o error on gearman connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("session is closed")]
    Closed,
    #[error("the read loop dropped the response channel before replying")]
    ResponseChannelDropped,
    #[error("protocol error: solicited reply {0:?} arrived with no pending request")]
    UnexpectedReply(Command),
}

/// One active (or just-closed) connection to a job server.
///
/// A session owns the write half directly and hands the read half to a
/// single spawned read loop. Solicited requests (anything sent via
/// [`Session::send`]) are correlated to their response through a FIFO of
/// `oneshot` senders, since the Gearman protocol replies to requests on a
/// given connection strictly in order. Unsolicited frames are instead
/// fanned out to every subscriber registered via
/// [`Session::register_unsolicited`], in registration order.
pub struct Session {
    addr: Option<SocketAddr>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<VecDeque<oneshot::Sender<Frame>>>,
    subscribers: Mutex<Vec<UnsolicitedHandler>>,
    cancel: CancellationToken,
}

impl Session {
    /// Connect to `addr` and spawn the read loop. The returned session is
    /// immediately usable for sending frames.
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Connect(addr, e))?;
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();
        Ok(Self::spawn(Some(addr), rd, wr))
    }

    /// Build a session directly from an already-split (or in-memory, e.g.
    /// `tokio::io::duplex`) reader/writer pair and spawn its read loop.
    pub fn spawn<R, W>(addr: Option<SocketAddr>, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Arc::new(Self {
            addr,
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        let loop_session = Arc::clone(&session);
        tokio::spawn(async move {
            loop_session.read_loop(reader).await;
        });

        session
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop the read loop and fail any requests still awaiting a reply.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Add `handler` to the set of subscribers fanned every unsolicited
    /// frame (see [`Command::is_unsolicited`]), in registration order.
    /// Duplicates (by `Arc` identity) are ignored.
    pub async fn register_unsolicited(&self, handler: UnsolicitedHandler) {
        let mut subscribers = self.subscribers.lock().await;
        if !subscribers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            subscribers.push(handler);
        }
    }

    /// Remove a previously registered subscriber. A no-op if it was never
    /// registered (or already removed).
    pub async fn unregister_unsolicited(&self, handler: &UnsolicitedHandler) {
        self.subscribers.lock().await.retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Write a frame to the wire without expecting a correlated reply.
    /// Used for fire-and-forget sends like `SubmitJobBg`-style pre-sleep
    /// announcements on connections that aren't otherwise waiting.
    pub async fn send_raw(&self, frame: &Frame) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let bytes = frame.encode_req();
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }

    /// Send a request frame and wait for the next solicited reply on this
    /// connection. Because Gearman servers reply in strict FIFO order,
    /// the request is queued on `pending` before the bytes are flushed so
    /// that a reply racing the write can never be misdelivered.
    pub async fn send(&self, frame: &Frame) -> Result<Frame, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push_back(tx);

        if let Err(e) = self.send_raw(frame).await {
            // the queued sender is simply dropped by fail_pending() when
            // the read loop notices the connection died, or right here if
            // the write itself failed.
            self.fail_pending().await;
            return Err(e);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Closed),
            res = rx => res.map_err(|_| SessionError::ResponseChannelDropped),
        }
    }

    /// Convenience wrapper for `ECHO_REQ`/`ECHO_RES` liveness checks.
    pub async fn echo(&self, payload: impl Into<Bytes>) -> Result<Bytes, SessionError> {
        let reply = self.send(&Frame::new(Command::EchoReq, payload)).await?;
        Ok(reply.payload)
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(tx) = pending.pop_front() {
            drop(tx);
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(&self, mut reader: R) {
        let mut decoder = FrameDecoder::for_replies();
        let mut buf = [0u8; 8192];

        loop {
            loop {
                match decoder.decode_next() {
                    Ok(Some(frame)) => {
                        if self.dispatch(frame).await {
                            self.cancel.cancel();
                            self.fail_pending().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "gearman session: frame decode error, closing connection");
                        self.cancel.cancel();
                        self.fail_pending().await;
                        return;
                    }
                }
            }

            if self.cancel.is_cancelled() {
                self.fail_pending().await;
                return;
            }

            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.fail_pending().await;
                    return;
                }
                res = reader.read(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "gearman session: read error, closing connection");
                        self.cancel.cancel();
                        self.fail_pending().await;
                        return;
                    }
                },
            };

            if n == 0 {
                debug!("gearman session: peer closed connection");
                self.cancel.cancel();
                self.fail_pending().await;
                return;
            }

            decoder.feed(&buf[..n]);
        }
    }

    /// Dispatch one decoded frame. Returns `true` if the caller must close
    /// the connection: a solicited-looking frame with nothing pending is a
    /// protocol error (spec.md §4.2/§7), not merely a warning.
    async fn dispatch(&self, frame: Frame) -> bool {
        if frame.command.is_unsolicited() {
            trace!(command = ?frame.command, "gearman session: fanning out unsolicited frame");
            let subscribers = self.subscribers.lock().await.clone();
            for handler in subscribers {
                // A panicking subscriber must not stop the remaining ones
                // (or take down the session's read loop).
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(frame.clone()))) {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(command = ?frame.command, panic = %msg, "gearman session: unsolicited subscriber panicked");
                }
            }
            return false;
        }

        let mut pending = self.pending.lock().await;
        match pending.pop_front() {
            Some(tx) => {
                let _ = tx.send(frame);
                false
            }
            None => {
                let err = SessionError::UnexpectedReply(frame.command);
                warn!(error = %err, "gearman session: closing connection");
                true
            }
        }
    }
}
