//! Server: accept loop, per-connection demux, per-call driver tasks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, Inbound};
use crate::dispatch::{CallContext, Dispatcher, RawHandler};
use crate::envelope::CallEnvelope;
use crate::error::TransportError;
use crate::frame::{read_preamble, Frame, FrameFlags};
use crate::status::Status;
use crate::tls::ServerTlsConfig;

type CancelMap = Arc<Mutex<HashMap<u32, CancellationToken>>>;

/// Serves one dispatcher over any number of connections.
pub struct Server {
    dispatcher: Dispatcher,
    tls: Option<ServerTlsConfig>,
}

impl Server {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bind and serve until the task is dropped.
    pub async fn serve(self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_listener(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (tcp, peer) = listener.accept().await?;
            let _ = tcp.set_nodelay(true);
            tracing::debug!(%peer, "accepted connection");
            let dispatcher = self.dispatcher.clone();
            match &self.tls {
                None => {
                    tokio::spawn(serve_conn(dispatcher, tcp));
                }
                Some(tls) => {
                    let acceptor = tls.acceptor();
                    tokio::spawn(async move {
                        match acceptor.accept(tcp).await {
                            Ok(io) => serve_conn(dispatcher, io).await,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "TLS handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }

    /// Serve a single established byte stream, e.g. one half of a
    /// `tokio::io::duplex` pair in tests.
    pub fn serve_stream<S>(&self, io: S) -> tokio::task::JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(serve_conn(self.dispatcher.clone(), io))
    }
}

/// Per-connection demux loop, the connection's only reader.
async fn serve_conn<S>(dispatcher: Dispatcher, io: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Acceptor side takes even call ids.
    let (conn, mut reader) = Conn::new(io, 2);
    let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));

    match read_preamble(&mut reader).await {
        Ok(()) => {}
        Err(TransportError::Closed) => return,
        Err(e) => {
            // Dropping the connection here fails a mismatched peer fast
            // instead of letting both sides wait on each other.
            tracing::warn!(error = %e, "rejecting connection");
            return;
        }
    }

    loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "transport failed");
                break;
            }
        };
        let flags = frame.flags();
        let call_id = frame.call_id;

        if flags.contains(FrameFlags::OPEN) {
            let Some(open) = frame.open else {
                tracing::warn!(call_id, "OPEN frame without call header");
                continue;
            };
            let method = open.method;
            let mut terminal = Terminal::new(call_id);
            let Some(handler) = dispatcher.get(&method) else {
                tracing::debug!(call_id, method, "unimplemented method");
                let status = Status::unimplemented(format!("unknown method: {method}"));
                terminal.send(&conn, status).await;
                continue;
            };
            let Some(rx) = conn.try_register_route(call_id) else {
                tracing::warn!(call_id, "call id already in flight, dropping open");
                continue;
            };
            let token = CancellationToken::new();
            let mut env = CallEnvelope::with_token(token.clone());
            if let Some(deadline) = CallEnvelope::deadline_from_wire(open.deadline_ns) {
                env.set_deadline(deadline);
            }
            for (key, value) in open.metadata {
                env.insert_metadata(key, value);
            }
            cancels.lock().insert(call_id, token);
            tracing::debug!(call_id, method, "accepted call");
            tokio::spawn(drive_call(
                conn.clone(),
                call_id,
                env,
                rx,
                handler,
                cancels.clone(),
                terminal,
            ));
            continue;
        }

        if flags.contains(FrameFlags::CANCEL) {
            tracing::debug!(call_id, "caller cancelled");
            if let Some(token) = cancels.lock().get(&call_id) {
                token.cancel();
            }
            continue;
        }

        if !conn.route(frame).await {
            tracing::trace!(call_id, "dropped frame for finished call");
        }
    }

    conn.shutdown();
    // Unblock any handler still running against the dead connection.
    for (_, token) in cancels.lock().drain() {
        token.cancel();
    }
}

/// Runs one call to completion and puts its single terminal status on the
/// wire. Deadline and cancellation are enforced here even for handlers that
/// never check the envelope; a panicking handler becomes a generic
/// `Internal` with the cause kept in the server log.
async fn drive_call(
    conn: Arc<Conn>,
    call_id: u32,
    env: CallEnvelope,
    rx: mpsc::Receiver<Inbound>,
    handler: RawHandler,
    cancels: CancelMap,
    mut terminal: Terminal,
) {
    let ctx = CallContext {
        conn: conn.clone(),
        call_id,
        env: env.clone(),
        rx,
    };
    let handler_fut = AssertUnwindSafe(handler(ctx)).catch_unwind();
    let status = tokio::select! {
        biased;
        status = env.aborted() => status,
        outcome = handler_fut => match outcome {
            Ok(status) => status,
            Err(_) => {
                tracing::error!(call_id, "handler panicked");
                Status::internal("internal error")
            }
        },
    };

    cancels.lock().remove(&call_id);
    conn.remove_route(call_id);

    terminal.send(&conn, status).await;
}

/// Once-guard for the terminal status, handed out when the OPEN is parsed
/// and carried through every exit of the call. A second terminal for the
/// same call is a bug in the driver, rejected loudly rather than silently
/// accepted.
struct Terminal {
    call_id: u32,
    sent: bool,
}

impl Terminal {
    fn new(call_id: u32) -> Self {
        Self {
            call_id,
            sent: false,
        }
    }

    async fn send(&mut self, conn: &Conn, status: Status) {
        assert!(
            !self.sent,
            "terminal status already sent for call {}",
            self.call_id
        );
        self.sent = true;
        if !status.is_ok() {
            tracing::debug!(call_id = self.call_id, code = %status.code, "call failed");
        }
        if let Err(e) = conn.send_frame(Frame::status(self.call_id, status)).await {
            tracing::debug!(call_id = self.call_id, error = %e, "terminal status undeliverable");
        }
    }
}
