//! In-process dispatch table for registered method handlers.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn};

use super::context::CallContext;
use super::handler::{HandlerKind, HandlerRegistry, MethodHandler, ResponseStream};

/// A registered handler with its message types erased.
struct Route {
    kind: HandlerKind,
    handler: Box<dyn Any + Send + Sync>,
}

/// Dispatch table keyed by full method path.
///
/// A tonic-generated service implementation delegates each method to the
/// matching `call_*` function, so every interceptor registered in front of
/// the router sees the call.
#[derive(Default)]
pub struct Router {
    routes: BTreeMap<String, Route>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no method is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Whether a handler is registered for `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    /// List every registered method as `"{path}: {kind}"`, sorted by path.
    pub fn describe(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|(path, route)| format!("{}: {}", path, route.kind))
            .collect()
    }

    /// Look up the handler registered for `path` with the given message types.
    pub fn handler<Req, Resp>(&self, path: &str) -> Result<MethodHandler<Req, Resp>, Status>
    where
        Req: 'static,
        Resp: 'static,
    {
        let route = self.routes.get(path).ok_or_else(|| {
            debug!(path = %path, "No handler registered");
            Status::unimplemented(format!("Method not found: {}", path))
        })?;

        route
            .handler
            .downcast_ref::<MethodHandler<Req, Resp>>()
            .cloned()
            .ok_or_else(|| {
                warn!(
                    path = %path,
                    kind = %route.kind,
                    "Handler registered with different message types"
                );
                Status::internal(format!("Message types do not match handler for {}", path))
            })
    }

    /// Dispatch a unary call with an existing context.
    pub async fn dispatch_unary<Req, Resp>(
        &self,
        path: &str,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<Resp, Status>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        match self.handler::<Req, Resp>(path)? {
            MethodHandler::Unary(handler) => handler.call(request, context).await,
            other => Err(kind_mismatch(path, other.kind(), HandlerKind::Unary)),
        }
    }

    /// Dispatch a server-streaming call with an existing context.
    pub async fn dispatch_server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        match self.handler::<Req, Resp>(path)? {
            MethodHandler::ServerStreaming(handler) => handler.call(request, context).await,
            other => Err(kind_mismatch(path, other.kind(), HandlerKind::ServerStreaming)),
        }
    }

    /// Serve a unary tonic request.
    pub async fn call_unary<Req, Resp>(
        &self,
        path: &str,
        request: tonic::Request<Req>,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let (message, context) = CallContext::from_request(path, request);
        self.dispatch_unary(path, Arc::new(message), Arc::new(context))
            .await
            .map(tonic::Response::new)
    }

    /// Serve a server-streaming tonic request.
    pub async fn call_server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: tonic::Request<Req>,
    ) -> Result<tonic::Response<ResponseStream<Resp>>, Status>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let (message, context) = CallContext::from_request(path, request);
        self.dispatch_server_streaming(path, Arc::new(message), Arc::new(context))
            .await
            .map(tonic::Response::new)
    }

    /// Serve a client-streaming tonic request.
    pub async fn call_client_streaming<S, Req, Resp>(
        &self,
        path: &str,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let handler = match self.handler::<Req, Resp>(path)? {
            MethodHandler::ClientStreaming(handler) => handler,
            other => return Err(kind_mismatch(path, other.kind(), HandlerKind::ClientStreaming)),
        };

        let (requests, context) = CallContext::from_request(path, request);
        handler
            .call(requests.boxed(), Arc::new(context))
            .await
            .map(tonic::Response::new)
    }

    /// Serve a bidirectional-streaming tonic request.
    pub async fn call_streaming<S, Req, Resp>(
        &self,
        path: &str,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<ResponseStream<Resp>>, Status>
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let handler = match self.handler::<Req, Resp>(path)? {
            MethodHandler::Streaming(handler) => handler,
            other => return Err(kind_mismatch(path, other.kind(), HandlerKind::Streaming)),
        };

        let (requests, context) = CallContext::from_request(path, request);
        handler
            .call(requests.boxed(), Arc::new(context))
            .await
            .map(tonic::Response::new)
    }
}

impl HandlerRegistry for Router {
    fn add_method_handler<Req, Resp>(&mut self, path: &str, handler: MethodHandler<Req, Resp>)
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let kind = handler.kind();
        if self.routes.contains_key(path) {
            warn!(path = %path, "Replacing existing handler");
        }

        info!(path = %path, kind = %kind, "Registered method handler");
        self.routes.insert(
            path.to_string(),
            Route {
                kind,
                handler: Box::new(handler),
            },
        );
    }
}

fn kind_mismatch(path: &str, actual: HandlerKind, expected: HandlerKind) -> Status {
    warn!(path = %path, actual = %actual, expected = %expected, "Handler kind mismatch");
    Status::internal(format!("{} is a {} method, not {}", path, actual, expected))
}
