//! Handler traits for the four gRPC call shapes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::Status;

use super::context::CallContext;

/// Stream of responses produced by a streaming handler.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// Stream of requests consumed by a client-streaming handler.
pub type RequestStream<T> = BoxStream<'static, Result<T, Status>>;

/// Handler for a unary call.
#[async_trait]
pub trait UnaryHandler<Req, Resp>: Send + Sync {
    /// Handle one request and produce one response.
    async fn call(&self, request: Arc<Req>, context: Arc<CallContext>) -> Result<Resp, Status>;
}

/// Handler for a server-streaming call.
#[async_trait]
pub trait ServerStreamingHandler<Req, Resp>: Send + Sync {
    /// Handle one request and produce a stream of responses.
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status>;
}

/// Handler for a client-streaming call.
#[async_trait]
pub trait ClientStreamingHandler<Req, Resp>: Send + Sync {
    /// Consume a stream of requests and produce one response.
    async fn call(
        &self,
        requests: RequestStream<Req>,
        context: Arc<CallContext>,
    ) -> Result<Resp, Status>;
}

/// Handler for a bidirectional-streaming call.
#[async_trait]
pub trait StreamingHandler<Req, Resp>: Send + Sync {
    /// Consume a stream of requests and produce a stream of responses.
    async fn call(
        &self,
        requests: RequestStream<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status>;
}

#[async_trait]
impl<Req, Resp, H> UnaryHandler<Req, Resp> for Arc<H>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
    H: UnaryHandler<Req, Resp> + ?Sized,
{
    async fn call(&self, request: Arc<Req>, context: Arc<CallContext>) -> Result<Resp, Status> {
        (**self).call(request, context).await
    }
}

#[async_trait]
impl<Req, Resp, H> ServerStreamingHandler<Req, Resp> for Arc<H>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
    H: ServerStreamingHandler<Req, Resp> + ?Sized,
{
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status> {
        (**self).call(request, context).await
    }
}

/// The shape of a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// One request, one response
    Unary,
    /// One request, a stream of responses
    ServerStreaming,
    /// A stream of requests, one response
    ClientStreaming,
    /// Streams in both directions
    Streaming,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Unary => "unary",
            HandlerKind::ServerStreaming => "server-streaming",
            HandlerKind::ClientStreaming => "client-streaming",
            HandlerKind::Streaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// A method handler of any call shape.
///
/// This is the unit passed through a [`HandlerRegistry`]; interceptors
/// replace the inner handler while keeping the shape.
pub enum MethodHandler<Req, Resp> {
    Unary(Arc<dyn UnaryHandler<Req, Resp>>),
    ServerStreaming(Arc<dyn ServerStreamingHandler<Req, Resp>>),
    ClientStreaming(Arc<dyn ClientStreamingHandler<Req, Resp>>),
    Streaming(Arc<dyn StreamingHandler<Req, Resp>>),
}

impl<Req, Resp> MethodHandler<Req, Resp> {
    /// The call shape of this handler.
    pub fn kind(&self) -> HandlerKind {
        match self {
            MethodHandler::Unary(_) => HandlerKind::Unary,
            MethodHandler::ServerStreaming(_) => HandlerKind::ServerStreaming,
            MethodHandler::ClientStreaming(_) => HandlerKind::ClientStreaming,
            MethodHandler::Streaming(_) => HandlerKind::Streaming,
        }
    }
}

impl<Req, Resp> Clone for MethodHandler<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            MethodHandler::Unary(h) => MethodHandler::Unary(Arc::clone(h)),
            MethodHandler::ServerStreaming(h) => MethodHandler::ServerStreaming(Arc::clone(h)),
            MethodHandler::ClientStreaming(h) => MethodHandler::ClientStreaming(Arc::clone(h)),
            MethodHandler::Streaming(h) => MethodHandler::Streaming(Arc::clone(h)),
        }
    }
}

impl<Req, Resp> fmt::Debug for MethodHandler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.kind()).finish()
    }
}

/// Registration point for method handlers.
///
/// Implemented by the dispatch table of a server and by interceptors that
/// decorate handlers before forwarding them to it.
pub trait HandlerRegistry {
    /// Register `handler` under the full method path.
    fn add_method_handler<Req, Resp>(&mut self, path: &str, handler: MethodHandler<Req, Resp>)
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static;
}

/// Unary handler backed by an async closure.
pub struct UnaryFn<F>(F);

/// Adapt an async closure into a unary handler.
pub fn unary_fn<F>(f: F) -> UnaryFn<F> {
    UnaryFn(f)
}

#[async_trait]
impl<Req, Resp, F, Fut> UnaryHandler<Req, Resp> for UnaryFn<F>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
    F: Fn(Arc<Req>, Arc<CallContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Status>> + Send,
{
    async fn call(&self, request: Arc<Req>, context: Arc<CallContext>) -> Result<Resp, Status> {
        (self.0)(request, context).await
    }
}

/// Server-streaming handler backed by an async closure.
pub struct ServerStreamingFn<F>(F);

/// Adapt an async closure into a server-streaming handler.
pub fn server_streaming_fn<F>(f: F) -> ServerStreamingFn<F> {
    ServerStreamingFn(f)
}

#[async_trait]
impl<Req, Resp, F, Fut> ServerStreamingHandler<Req, Resp> for ServerStreamingFn<F>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
    F: Fn(Arc<Req>, Arc<CallContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseStream<Resp>, Status>> + Send,
{
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status> {
        (self.0)(request, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_unary_fn_adapter() {
        let handler = unary_fn(|request: Arc<String>, _ctx: Arc<CallContext>| async move {
            Ok::<_, Status>(format!("Hello, {}!", request))
        });

        let ctx = Arc::new(CallContext::new("/test.Greeter/SayHello"));
        let response = handler.call(Arc::new("World".to_string()), ctx).await.unwrap();

        assert_eq!(response, "Hello, World!");
    }

    #[tokio::test]
    async fn test_server_streaming_fn_adapter() {
        let handler = server_streaming_fn(|request: Arc<u32>, _ctx: Arc<CallContext>| async move {
            let items: Vec<Result<u32, Status>> = (0..*request).map(Ok).collect();
            Ok::<_, Status>(futures::stream::iter(items).boxed())
        });

        let ctx = Arc::new(CallContext::new("/test.Counter/Count"));
        let stream = handler.call(Arc::new(3), ctx).await.unwrap();
        let items: Vec<u32> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(items, vec![0, 1, 2]);
    }

    #[test]
    fn test_method_handler_kind() {
        let handler: MethodHandler<String, String> = MethodHandler::Unary(Arc::new(unary_fn(
            |request: Arc<String>, _ctx: Arc<CallContext>| async move {
                Ok::<_, Status>(request.to_string())
            },
        )));

        assert_eq!(handler.kind(), HandlerKind::Unary);
        assert_eq!(handler.kind().to_string(), "unary");
    }
}
