//! Method dispatch: a name-to-handler map built once at startup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::conn::{Conn, Inbound};
use crate::envelope::CallEnvelope;
use crate::error::ConfigError;
use crate::status::Status;
use crate::stream::{Side, StreamReceiver, StreamSender};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Everything a handler invocation needs, assembled by the per-call driver.
pub(crate) struct CallContext {
    pub(crate) conn: Arc<Conn>,
    pub(crate) call_id: u32,
    pub(crate) env: CallEnvelope,
    pub(crate) rx: mpsc::Receiver<Inbound>,
}

/// Shape-erased handler. The returned status is the call's terminal status;
/// the driver puts it on the wire exactly once.
pub(crate) type RawHandler = Arc<dyn Fn(CallContext) -> BoxFuture<Status> + Send + Sync>;

/// Registry of handlers, immutable once built.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HashMap<String, RawHandler>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn get(&self, method: &str) -> Option<RawHandler> {
        self.handlers.get(method).cloned()
    }
}

/// Typed handler registration. Duplicate method names are startup-fatal.
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<String, RawHandler>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// One request in, one response out.
    pub fn unary<Req, Resp, F, Fut>(self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req, CallEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            method,
            Arc::new(move |ctx: CallContext| {
                let f = f.clone();
                Box::pin(async move {
                    let CallContext { conn, call_id, env, rx } = ctx;
                    let mut requests: StreamReceiver<Req> = StreamReceiver::new(
                        conn.clone(),
                        call_id,
                        env.clone(),
                        rx,
                        Side::Callee,
                    );
                    let request = match requests.recv().await {
                        Ok(Some(request)) => request,
                        Ok(None) => {
                            return Status::invalid_argument("call closed without a request")
                        }
                        Err(e) => return Status::from(e),
                    };
                    match f(request, env.clone()).await {
                        Ok(response) => {
                            let mut sink: StreamSender<Resp> =
                                StreamSender::new(conn, call_id, env);
                            match sink.send(&response).await {
                                Ok(()) => Status::ok(),
                                Err(e) => Status::from(e),
                            }
                        }
                        Err(status) => status,
                    }
                })
            }),
        )
    }

    /// One request in, a response stream out.
    pub fn server_streaming<Req, Resp, F, Fut>(
        self,
        method: &str,
        f: F,
    ) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req, StreamSender<Resp>, CallEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            method,
            Arc::new(move |ctx: CallContext| {
                let f = f.clone();
                Box::pin(async move {
                    let CallContext { conn, call_id, env, rx } = ctx;
                    let mut requests: StreamReceiver<Req> = StreamReceiver::new(
                        conn.clone(),
                        call_id,
                        env.clone(),
                        rx,
                        Side::Callee,
                    );
                    let request = match requests.recv().await {
                        Ok(Some(request)) => request,
                        Ok(None) => {
                            return Status::invalid_argument("call closed without a request")
                        }
                        Err(e) => return Status::from(e),
                    };
                    let sink = StreamSender::new(conn, call_id, env.clone());
                    match f(request, sink, env).await {
                        Ok(()) => Status::ok(),
                        Err(status) => status,
                    }
                })
            }),
        )
    }

    /// A request stream in, one response out. The handler sees end-of-stream
    /// only after the caller half-closes.
    pub fn client_streaming<Req, Resp, F, Fut>(
        self,
        method: &str,
        f: F,
    ) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(StreamReceiver<Req>, CallEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            method,
            Arc::new(move |ctx: CallContext| {
                let f = f.clone();
                Box::pin(async move {
                    let CallContext { conn, call_id, env, rx } = ctx;
                    let requests = StreamReceiver::new(
                        conn.clone(),
                        call_id,
                        env.clone(),
                        rx,
                        Side::Callee,
                    );
                    match f(requests, env.clone()).await {
                        Ok(response) => {
                            let mut sink: StreamSender<Resp> =
                                StreamSender::new(conn, call_id, env);
                            match sink.send(&response).await {
                                Ok(()) => Status::ok(),
                                Err(e) => Status::from(e),
                            }
                        }
                        Err(status) => status,
                    }
                })
            }),
        )
    }

    /// Both directions stream, independently.
    pub fn bidi<Req, Resp, F, Fut>(self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(StreamReceiver<Req>, StreamSender<Resp>, CallEnvelope) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            method,
            Arc::new(move |ctx: CallContext| {
                let f = f.clone();
                Box::pin(async move {
                    let CallContext { conn, call_id, env, rx } = ctx;
                    let requests = StreamReceiver::new(
                        conn.clone(),
                        call_id,
                        env.clone(),
                        rx,
                        Side::Callee,
                    );
                    let sink = StreamSender::new(conn, call_id, env.clone());
                    match f(requests, sink, env).await {
                        Ok(()) => Status::ok(),
                        Err(status) => status,
                    }
                })
            }),
        )
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: Arc::new(self.handlers),
        }
    }

    fn insert(mut self, method: &str, handler: RawHandler) -> Result<Self, ConfigError> {
        if self.handlers.contains_key(method) {
            return Err(ConfigError::DuplicateMethod(method.to_owned()));
        }
        self.handlers.insert(method.to_owned(), handler);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_method_name_is_rejected() {
        let result = DispatcherBuilder::new()
            .unary("calc.sum", |x: u32, _env| async move { Ok(x) })
            .unwrap()
            .unary("calc.sum", |x: u32, _env| async move { Ok(x + 1) });
        assert!(matches!(result, Err(ConfigError::DuplicateMethod(_))));
    }

    // The erased handlers must stay Send-boxable with non-trivial message
    // types in every shape.
    #[test]
    fn all_four_shapes_register() {
        let dispatcher = DispatcherBuilder::new()
            .unary("echo", |x: String, _env| async move { Ok(x) })
            .unwrap()
            .server_streaming(
                "fan_out",
                |x: String, mut sink: StreamSender<String>, _env| async move {
                    sink.send(&x).await?;
                    Ok(())
                },
            )
            .unwrap()
            .client_streaming(
                "gather",
                |mut requests: StreamReceiver<String>, _env| async move {
                    let mut joined = String::new();
                    while let Some(part) = requests.recv().await? {
                        joined.push_str(&part);
                    }
                    Ok(joined)
                },
            )
            .unwrap()
            .bidi(
                "relay",
                |mut requests: StreamReceiver<String>,
                 mut sink: StreamSender<String>,
                 _env| async move {
                    while let Some(part) = requests.recv().await? {
                        sink.send(&part).await?;
                    }
                    Ok(())
                },
            )
            .unwrap()
            .build();
        for method in ["echo", "fan_out", "gather", "relay"] {
            assert!(dispatcher.get(method).is_some());
        }
    }

    #[test]
    fn lookup_misses_unregistered_methods() {
        let dispatcher = DispatcherBuilder::new()
            .unary("calc.sum", |x: u32, _env| async move { Ok(x) })
            .unwrap()
            .build();
        assert!(dispatcher.get("calc.sum").is_some());
        assert!(dispatcher.get("calc.other").is_none());
    }
}
