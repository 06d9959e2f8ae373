//! Typed stream halves for one direction of a call.
//!
//! Every call shape is built from these two halves: the sender serializes
//! and writes DATA frames, the receiver decodes frames routed to its call.
//! Each half closes independently; end-of-stream is observed exactly once.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::conn::{Conn, Inbound};
use crate::envelope::CallEnvelope;
use crate::error::{RpcError, TransportError};
use crate::frame::Frame;
use crate::status::Status;

/// Which side of the call owns the half. Only the caller side turns a
/// cancellation into a CANCEL frame for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Caller,
    Callee,
}

/// A send on a closed connection is a transport fault unless the user closed
/// the channel, in which case the call observes `Cancelled`.
pub(crate) fn closed_error(conn: &Conn) -> RpcError {
    if conn.is_closed_by_user() {
        RpcError::Status(Status::cancelled("channel closed"))
    } else {
        RpcError::Transport(TransportError::Closed)
    }
}

/// Outbound half of one stream direction.
pub struct StreamSender<T> {
    conn: Arc<Conn>,
    call_id: u32,
    env: CallEnvelope,
    finished: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> StreamSender<T> {
    pub(crate) fn new(conn: Arc<Conn>, call_id: u32, env: CallEnvelope) -> Self {
        Self {
            conn,
            call_id,
            env,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// Send one message. Preserves FIFO order within the direction.
    ///
    /// Suspends only while the connection writer is busy; a cancelled or
    /// expired envelope unblocks the suspension with the matching status.
    pub async fn send(&mut self, item: &T) -> Result<(), RpcError> {
        if self.finished {
            return Err(RpcError::Status(Status::internal(
                "send after end of stream",
            )));
        }
        self.env.check().map_err(RpcError::Status)?;
        let payload = postcard::to_allocvec(item)
            .map_err(|e| RpcError::Transport(TransportError::Codec(e)))?;
        self.write(Frame::data(self.call_id, payload)).await
    }

    /// Half-close this direction. Further sends are rejected; the peer
    /// observes end-of-stream after all buffered messages.
    pub async fn finish(mut self) -> Result<(), RpcError> {
        self.finished = true;
        let frame = Frame::eos(self.call_id);
        self.write(frame).await
    }

    async fn write(&mut self, frame: Frame) -> Result<(), RpcError> {
        // Abort only while queued for the writer. Once the frame starts
        // going out it is written whole; tearing it mid-write would
        // desynchronize every other call on the connection.
        let mut writer = tokio::select! {
            biased;
            status = self.env.aborted() => return Err(RpcError::Status(status)),
            writer = self.conn.writer() => match writer {
                Ok(writer) => writer,
                Err(TransportError::Closed) => return Err(closed_error(&self.conn)),
                Err(other) => return Err(RpcError::Transport(other)),
            },
        };
        writer.write_frame(&frame).await.map_err(|e| match e {
            TransportError::Closed => closed_error(&self.conn),
            other => RpcError::Transport(other),
        })
    }
}

/// Inbound half of one stream direction.
pub struct StreamReceiver<T> {
    conn: Arc<Conn>,
    call_id: u32,
    env: CallEnvelope,
    rx: mpsc::Receiver<Inbound>,
    side: Side,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamReceiver<T> {
    pub(crate) fn new(
        conn: Arc<Conn>,
        call_id: u32,
        env: CallEnvelope,
        rx: mpsc::Receiver<Inbound>,
        side: Side,
    ) -> Self {
        Self {
            conn,
            call_id,
            env,
            rx,
            side,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Receive the next message.
    ///
    /// `Ok(None)` marks end-of-stream, delivered exactly once and sticky
    /// afterwards. A non-OK terminal status surfaces as `RpcError::Status`;
    /// cancellation and deadline expiry unblock a suspended receive within
    /// one scheduling step.
    pub async fn recv(&mut self) -> Result<Option<T>, RpcError> {
        if self.done {
            return Ok(None);
        }
        tokio::select! {
            biased;
            status = self.env.aborted() => {
                self.done = true;
                if self.side == Side::Caller {
                    // Tell the peer the caller gave up on the call. Best
                    // effort off-task: a congested writer must not keep the
                    // caller blocked past its own deadline.
                    let conn = self.conn.clone();
                    let call_id = self.call_id;
                    tokio::spawn(async move {
                        let _ = conn.send_frame(Frame::cancel(call_id)).await;
                    });
                }
                self.conn.remove_route(self.call_id);
                Err(RpcError::Status(status))
            }
            inbound = self.rx.recv() => match inbound {
                Some(Inbound::Data(bytes)) => {
                    let item = postcard::from_bytes(&bytes)
                        .map_err(|e| RpcError::Transport(TransportError::Codec(e)))?;
                    Ok(Some(item))
                }
                Some(Inbound::End) => {
                    self.done = true;
                    Ok(None)
                }
                Some(Inbound::Status(status)) => {
                    self.done = true;
                    if status.is_ok() {
                        Ok(None)
                    } else {
                        Err(RpcError::Status(status))
                    }
                }
                None => {
                    self.done = true;
                    Err(closed_error(&self.conn))
                }
            }
        }
    }

    /// Drain the remaining messages until end-of-stream.
    pub async fn collect(mut self) -> Result<Vec<T>, RpcError> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await? {
            items.push(item);
        }
        Ok(items)
    }
}

impl<T> Drop for StreamReceiver<T> {
    fn drop(&mut self) {
        // An abandoned receiver stops consuming; later frames for this call
        // are dropped at the demux loop.
        self.conn.remove_route(self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_preamble, FrameFlags};
    use crate::status::StatusCode;
    use std::time::Duration;

    fn test_conn() -> Arc<Conn> {
        let (a, _b) = tokio::io::duplex(4096);
        let (conn, _reader) = Conn::new(a, 1);
        conn
    }

    #[tokio::test]
    async fn receiver_yields_data_then_end_once() {
        let conn = test_conn();
        let rx = conn.register_route(1);
        let mut recv: StreamReceiver<u32> =
            StreamReceiver::new(conn.clone(), 1, CallEnvelope::new(), rx, Side::Callee);

        let payload = postcard::to_allocvec(&7u32).unwrap();
        assert!(conn.route(Frame::data(1, payload)).await);
        assert!(conn.route(Frame::eos(1)).await);

        assert_eq!(recv.recv().await.unwrap(), Some(7));
        assert_eq!(recv.recv().await.unwrap(), None);
        assert_eq!(recv.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn receiver_surfaces_error_status() {
        let conn = test_conn();
        let rx = conn.register_route(1);
        let mut recv: StreamReceiver<u32> =
            StreamReceiver::new(conn.clone(), 1, CallEnvelope::new(), rx, Side::Callee);

        assert!(conn.route(Frame::status(1, Status::not_found("nope"))).await);
        match recv.recv().await {
            Err(RpcError::Status(status)) => assert_eq!(status.code, StatusCode::NotFound),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_envelope_rejects_send() {
        let conn = test_conn();
        let env = CallEnvelope::new();
        env.cancel();
        let mut sender: StreamSender<u32> = StreamSender::new(conn, 1, env);
        match sender.send(&1).await {
            Err(RpcError::Status(status)) => assert_eq!(status.code, StatusCode::Cancelled),
            other => panic!("expected cancelled, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_send_never_tears_a_frame() {
        let (a, mut b) = tokio::io::duplex(64);
        let (conn, _reader) = Conn::new(a, 1);

        // Call 1 jams the tiny pipe with a large frame and holds the writer.
        let mut jammed: StreamSender<Vec<u8>> =
            StreamSender::new(conn.clone(), 1, CallEnvelope::new());
        let payload = vec![7u8; 8192];
        let expected = payload.clone();
        let jam = tokio::spawn(async move { jammed.send(&payload).await });
        tokio::task::yield_now().await;

        // Call 3 is queued behind it and its deadline fires while waiting.
        let mut env = CallEnvelope::new();
        env.set_timeout(Duration::from_millis(50));
        let mut starved: StreamSender<u32> = StreamSender::new(conn.clone(), 3, env);
        let err = starved.send(&9).await.unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::DeadlineExceeded));

        // Drain the peer: the jammed frame arrives whole, with no bytes of
        // the aborted call spliced in.
        read_preamble(&mut b).await.unwrap();
        let frame = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(frame.call_id, 1);
        assert_eq!(
            postcard::from_bytes::<Vec<u8>>(&frame.payload).unwrap(),
            expected
        );
        jam.await.unwrap().unwrap();

        // The connection still frames cleanly afterwards.
        conn.send_frame(Frame::eos(1)).await.unwrap();
        let frame = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(frame.call_id, 1);
        assert!(frame.flags().contains(FrameFlags::EOS));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_unblocks_a_receive_behind_a_jammed_writer() {
        // Nobody drains the peer end, so the writer stays congested.
        let (a, _b) = tokio::io::duplex(64);
        let (conn, _reader) = Conn::new(a, 1);
        let mut jammed: StreamSender<Vec<u8>> =
            StreamSender::new(conn.clone(), 1, CallEnvelope::new());
        let _jam = tokio::spawn(async move { jammed.send(&vec![0u8; 8192]).await });
        tokio::task::yield_now().await;

        // The receive must still unblock at its deadline even though the
        // CANCEL frame cannot be flushed yet.
        let rx = conn.register_route(3);
        let mut env = CallEnvelope::new();
        env.set_timeout(Duration::from_millis(50));
        let mut receiver: StreamReceiver<u32> =
            StreamReceiver::new(conn.clone(), 3, env, rx, Side::Caller);
        let err = receiver.recv().await.unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::DeadlineExceeded));
    }

    #[tokio::test]
    async fn close_delivers_cancelled_to_open_calls() {
        let conn = test_conn();
        let rx = conn.register_route(1);
        let mut recv: StreamReceiver<u32> =
            StreamReceiver::new(conn.clone(), 1, CallEnvelope::new(), rx, Side::Caller);
        conn.close();
        match recv.recv().await {
            Err(RpcError::Status(status)) => assert_eq!(status.code, StatusCode::Cancelled),
            other => panic!("expected cancelled, got {other:?}"),
        }
    }
}
