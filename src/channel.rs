//! Client channel: one multiplexed connection, many concurrent typed calls.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conn::{BoxedReader, Conn, Inbound};
use crate::envelope::CallEnvelope;
use crate::error::{RpcError, TransportError};
use crate::frame::{read_preamble, Frame, OpenCall};
use crate::status::Status;
use crate::stream::{closed_error, Side, StreamReceiver, StreamSender};
use crate::tls::Security;

/// Per-call knobs: deadline, cancellation, metadata.
#[derive(Default)]
pub struct CallOptions {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    metadata: Vec<(String, String)>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute point after which the call fails with `DeadlineExceeded`.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Relative form of [`CallOptions::deadline`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel the call by cancelling this token.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    fn into_envelope(self) -> CallEnvelope {
        let mut env = match self.cancel {
            Some(token) => CallEnvelope::with_token(token),
            None => CallEnvelope::new(),
        };
        if let Some(deadline) = self.deadline {
            env.set_deadline(deadline);
        } else if let Some(timeout) = self.timeout {
            env.set_timeout(timeout);
        }
        for (key, value) in self.metadata {
            env.insert_metadata(key, value);
        }
        env
    }
}

/// The deferred single response of a unary or client-streaming call.
pub struct UnaryResponse<Resp> {
    receiver: StreamReceiver<Resp>,
}

impl<Resp: DeserializeOwned> UnaryResponse<Resp> {
    /// Suspend until exactly one response or a terminal status arrives.
    pub async fn wait(mut self) -> Result<Resp, RpcError> {
        match self.receiver.recv().await? {
            Some(response) => match self.receiver.recv().await {
                Ok(None) => Ok(response),
                Ok(Some(_)) => Err(RpcError::Status(Status::internal(
                    "more than one response to a unary call",
                ))),
                Err(e) => Err(e),
            },
            None => Err(RpcError::Status(Status::internal(
                "call ended without a response",
            ))),
        }
    }
}

/// Caller end of a connection. Calls multiplex freely; only the writer and
/// the route table are serialized, never whole-call payloads.
pub struct Channel {
    conn: Arc<Conn>,
}

impl Channel {
    /// Connect over TCP with the requested security.
    ///
    /// A refused connection or a failed handshake (including dialing a
    /// plaintext endpoint with TLS) is `TransportError::Unavailable` —
    /// transport-level, never a call status.
    pub async fn connect(addr: &str, security: Security) -> Result<Self, TransportError> {
        // A peer that accepts the socket but never answers the handshake
        // (e.g. a plaintext endpoint swallowing a ClientHello) must not
        // hang the caller.
        const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Unavailable(format!("connect {addr}: timed out")))?
            .map_err(|e| TransportError::Unavailable(format!("connect {addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);
        match security {
            Security::Insecure => Ok(Self::from_stream(tcp)),
            Security::Tls(config) => {
                let handshake = config.connector().connect(config.server_name(), tcp);
                let io = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
                    .await
                    .map_err(|_| {
                        TransportError::Unavailable(format!(
                            "TLS handshake with {addr}: timed out"
                        ))
                    })?
                    .map_err(|e| {
                        TransportError::Unavailable(format!("TLS handshake with {addr}: {e}"))
                    })?;
                Ok(Self::from_stream(io))
            }
        }
    }

    /// Build a channel over any established byte stream, e.g. one half of a
    /// `tokio::io::duplex` pair in tests.
    pub fn from_stream<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Callers allocate odd ids; even ids stay reserved for the peer.
        let (conn, reader) = Conn::new(io, 1);
        tokio::spawn(demux(conn.clone(), reader));
        Self { conn }
    }

    /// Close the channel. Every still-open call observes `Cancelled` on its
    /// next operation.
    pub fn close(&self) {
        self.conn.close();
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let env = options.into_envelope();
        let (call_id, rx) = self.open(method, &env).await?;
        let mut sender: StreamSender<Req> =
            StreamSender::new(self.conn.clone(), call_id, env.clone());
        let receiver = StreamReceiver::new(self.conn.clone(), call_id, env, rx, Side::Caller);
        if let Err(e) = sender.send(request).await {
            self.abort_call(call_id);
            return Err(e);
        }
        if let Err(e) = sender.finish().await {
            self.abort_call(call_id);
            return Err(e);
        }
        UnaryResponse { receiver }.wait().await
    }

    /// One request, a stream of responses. A non-OK terminal status
    /// truncates the stream and surfaces from `recv`.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<StreamReceiver<Resp>, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let env = options.into_envelope();
        let (call_id, rx) = self.open(method, &env).await?;
        let mut sender: StreamSender<Req> =
            StreamSender::new(self.conn.clone(), call_id, env.clone());
        let receiver = StreamReceiver::new(self.conn.clone(), call_id, env, rx, Side::Caller);
        if let Err(e) = sender.send(request).await {
            self.abort_call(call_id);
            return Err(e);
        }
        if let Err(e) = sender.finish().await {
            self.abort_call(call_id);
            return Err(e);
        }
        Ok(receiver)
    }

    /// A stream of requests, one response. The response is only computed
    /// after [`StreamSender::finish`] half-closes the request direction.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<(StreamSender<Req>, UnaryResponse<Resp>), RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let env = options.into_envelope();
        let (call_id, rx) = self.open(method, &env).await?;
        let sender = StreamSender::new(self.conn.clone(), call_id, env.clone());
        let receiver = StreamReceiver::new(self.conn.clone(), call_id, env, rx, Side::Caller);
        Ok((sender, UnaryResponse { receiver }))
    }

    /// Both directions stream, independently and concurrently.
    pub async fn bidi<Req, Resp>(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<(StreamSender<Req>, StreamReceiver<Resp>), RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let env = options.into_envelope();
        let (call_id, rx) = self.open(method, &env).await?;
        let sender = StreamSender::new(self.conn.clone(), call_id, env.clone());
        let receiver = StreamReceiver::new(self.conn.clone(), call_id, env, rx, Side::Caller);
        Ok((sender, receiver))
    }

    /// Allocate a call id, register its inbound route, send OPEN.
    ///
    /// The route must exist before the OPEN frame is on the wire, otherwise
    /// a fast peer could answer into the void.
    async fn open(
        &self,
        method: &str,
        env: &CallEnvelope,
    ) -> Result<(u32, mpsc::Receiver<Inbound>), RpcError> {
        env.check().map_err(RpcError::Status)?;
        let call_id = self.conn.next_call_id();
        let rx = self.conn.register_route(call_id);
        let open = OpenCall {
            method: method.to_owned(),
            deadline_ns: env.wire_deadline(),
            metadata: env.wire_metadata(),
        };
        tracing::debug!(call_id, method, "opening call");
        if let Err(e) = self.conn.send_frame(Frame::open(call_id, open)).await {
            self.conn.remove_route(call_id);
            return Err(match e {
                TransportError::Closed => closed_error(&self.conn),
                other => RpcError::Transport(other),
            });
        }
        Ok((call_id, rx))
    }

    /// Tears the route down immediately; the CANCEL frame itself is
    /// best-effort and must not block a caller that already has its
    /// outcome behind a congested transport.
    fn abort_call(&self, call_id: u32) {
        self.conn.remove_route(call_id);
        let conn = self.conn.clone();
        tokio::spawn(async move {
            let _ = conn.send_frame(Frame::cancel(call_id)).await;
        });
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.conn.close();
    }
}

/// The only reader of the connection. Routes every inbound frame to its
/// call; a dead transport tears the route table down so suspended calls
/// observe a transport-level close.
async fn demux(conn: Arc<Conn>, mut reader: BoxedReader) {
    let closer = conn.closer().clone();
    match read_preamble(&mut reader).await {
        Ok(()) => {}
        Err(TransportError::Closed) => {
            conn.shutdown();
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "handshake with peer failed");
            conn.shutdown();
            return;
        }
    }
    loop {
        let frame = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            frame = Frame::read_from(&mut reader) => frame,
        };
        match frame {
            Ok(frame) => {
                if !conn.route(frame).await {
                    tracing::trace!("dropped frame for finished call");
                }
            }
            Err(TransportError::Closed) => {
                conn.shutdown();
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport failed");
                conn.shutdown();
                break;
            }
        }
    }
}
