//! Shared multiplexed connection state.
//!
//! One connection serves many concurrent calls. Exactly one demux task per
//! side reads frames and routes them by `call_id`; all outbound frames go
//! through the serialized writer. Only internal bookkeeping (route table,
//! call-id allocation, the writer) is shared between calls; no call ever
//! observes another call's frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::frame::{Frame, FrameFlags, PREAMBLE};
use crate::status::Status;

/// Inbound buffer per call. A lagging consumer applies backpressure at the
/// connection, the same policy as a bounded tunnel channel.
pub(crate) const ROUTE_CAPACITY: usize = 64;

/// A stream event routed to one call by the demux loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Payload of one DATA frame, in send order.
    Data(Bytes),
    /// The peer half-closed its direction.
    End,
    /// Terminal status; the route is removed after delivery.
    Status(Status),
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;
pub(crate) type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Exclusive access to the outbound half. The preamble goes out ahead of
/// whichever frame is written first.
pub(crate) struct WriterState {
    io: BoxedWriter,
    preamble_sent: bool,
}

impl WriterState {
    /// Write one frame to completion. A frame that has started going out
    /// must never be abandoned: a torn frame desynchronizes the peer's
    /// length-prefixed reader and poisons every other call on the
    /// connection, so abort gating belongs *before* this point.
    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.preamble_sent {
            self.io.write_all(&PREAMBLE).await?;
            self.preamble_sent = true;
        }
        frame.write_to(&mut self.io).await
    }
}

pub(crate) struct Conn {
    writer: AsyncMutex<WriterState>,
    routes: Mutex<HashMap<u32, mpsc::Sender<Inbound>>>,
    next_call_id: AtomicU32,
    /// Set by an explicit user close; open calls observe `Cancelled`.
    closed_by_user: AtomicBool,
    /// Set when the transport died underneath us.
    dead: AtomicBool,
    /// Stops the demux loop.
    closer: CancellationToken,
}

impl Conn {
    /// Split the stream; callers take odd ids, acceptors even ones, so a
    /// future peer-initiated call can never collide.
    pub(crate) fn new<S>(io: S, first_call_id: u32) -> (Arc<Self>, BoxedReader)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let conn = Arc::new(Self {
            writer: AsyncMutex::new(WriterState {
                io: Box::new(writer),
                preamble_sent: false,
            }),
            routes: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(first_call_id),
            closed_by_user: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            closer: CancellationToken::new(),
        });
        (conn, Box::new(reader))
    }

    pub(crate) fn next_call_id(&self) -> u32 {
        self.next_call_id.fetch_add(2, Ordering::Relaxed)
    }

    pub(crate) fn closer(&self) -> &CancellationToken {
        &self.closer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed_by_user.load(Ordering::Acquire) || self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed_by_user(&self) -> bool {
        self.closed_by_user.load(Ordering::Acquire)
    }

    /// Wait for the writer. Callers that must stay abortable select against
    /// this; once the guard is held, the frame write runs to completion.
    pub(crate) async fn writer(&self) -> Result<MutexGuard<'_, WriterState>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.writer.lock().await)
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.writer().await?.write_frame(&frame).await
    }

    /// Register the inbound route for a new call.
    ///
    /// Callers allocate ids from `next_call_id`, so a collision here is a
    /// programming error.
    pub(crate) fn register_route(&self, call_id: u32) -> mpsc::Receiver<Inbound> {
        match self.try_register_route(call_id) {
            Some(rx) => rx,
            None => panic!("route already registered for call {call_id}"),
        }
    }

    /// Register a route for a peer-chosen id; `None` if already taken.
    pub(crate) fn try_register_route(&self, call_id: u32) -> Option<mpsc::Receiver<Inbound>> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        let mut routes = self.routes.lock();
        if routes.contains_key(&call_id) {
            return None;
        }
        routes.insert(call_id, tx);
        Some(rx)
    }

    pub(crate) fn remove_route(&self, call_id: u32) {
        self.routes.lock().remove(&call_id);
    }

    /// Route a frame's stream events to the owning call.
    ///
    /// Returns `false` if no route exists for the call. A present terminal
    /// status implies end-of-direction, so it supersedes a bare EOS.
    pub(crate) async fn route(&self, frame: Frame) -> bool {
        let call_id = frame.call_id;
        let flags = frame.flags();
        let sender = self.routes.lock().get(&call_id).cloned();
        let Some(tx) = sender else {
            return false;
        };

        if flags.contains(FrameFlags::DATA)
            && tx.send(Inbound::Data(Bytes::from(frame.payload))).await.is_err()
        {
            // Receiver gone; the call is over locally.
            self.remove_route(call_id);
            return true;
        }
        if let Some(status) = frame.status {
            let _ = tx.send(Inbound::Status(status)).await;
            self.remove_route(call_id);
        } else if flags.contains(FrameFlags::EOS) {
            let _ = tx.send(Inbound::End).await;
        }
        true
    }

    /// Explicit close: every call still open observes `Cancelled` on its
    /// next operation.
    pub(crate) fn close(&self) {
        if self.closed_by_user.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("connection closed by user");
        self.closer.cancel();
        let routes: Vec<_> = self.routes.lock().drain().collect();
        for (_, tx) in routes {
            let _ = tx.try_send(Inbound::Status(Status::cancelled("channel closed")));
        }
    }

    /// The transport died: drop all routes so suspended receivers observe a
    /// transport-level close rather than a call-level status.
    pub(crate) fn shutdown(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("connection shut down");
        self.closer.cancel();
        self.routes.lock().clear();
    }
}
