//! Registry interceptor that emits lifecycle signals around handlers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::debug;

use super::bus::{LifecycleEvent, RequestInfo, SignalBus};
use crate::grpc::{
    CallContext, HandlerRegistry, MethodHandler, ResponseStream, ServerStreamingHandler,
    UnaryHandler,
};

/// Wraps handlers registered through it so every call emits
/// started, then finished or failed, on a [`SignalBus`].
///
/// Unary and server-streaming handlers are wrapped; client-streaming and
/// bidirectional handlers are forwarded unchanged.
pub struct SignalWrapper<'r, R: HandlerRegistry> {
    registry: &'r mut R,
    bus: Arc<SignalBus>,
}

impl<'r, R: HandlerRegistry> SignalWrapper<'r, R> {
    /// Wrap `registry`, sending to the global bus.
    pub fn new(registry: &'r mut R) -> Self {
        Self::with_bus(registry, SignalBus::global())
    }

    /// Wrap `registry`, sending to `bus`.
    pub fn with_bus(registry: &'r mut R, bus: Arc<SignalBus>) -> Self {
        Self { registry, bus }
    }

    /// The bus events are sent to.
    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }
}

impl<R: HandlerRegistry> HandlerRegistry for SignalWrapper<'_, R> {
    fn add_method_handler<Req, Resp>(&mut self, path: &str, handler: MethodHandler<Req, Resp>)
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let handler = with_signals(Arc::clone(&self.bus), path, handler);
        self.registry.add_method_handler(path, handler);
    }
}

/// Decorate `handler` so its calls are reported on `bus`.
pub fn with_signals<Req, Resp>(
    bus: Arc<SignalBus>,
    path: &str,
    handler: MethodHandler<Req, Resp>,
) -> MethodHandler<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    match handler {
        MethodHandler::Unary(inner) => {
            MethodHandler::Unary(Arc::new(SignalledUnary { inner, bus }))
        }
        MethodHandler::ServerStreaming(inner) => {
            MethodHandler::ServerStreaming(Arc::new(SignalledServerStreaming { inner, bus }))
        }
        other => {
            debug!(
                method = %path,
                kind = %other.kind(),
                "Registering handler without lifecycle signals"
            );
            other
        }
    }
}

struct SignalledUnary<Req, Resp> {
    inner: Arc<dyn UnaryHandler<Req, Resp>>,
    bus: Arc<SignalBus>,
}

#[async_trait]
impl<Req, Resp> UnaryHandler<Req, Resp> for SignalledUnary<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, request: Arc<Req>, context: Arc<CallContext>) -> Result<Resp, Status> {
        self.bus
            .send(&LifecycleEvent::Started(RequestInfo::new(&*request, &context)));

        let result = self.inner.call(Arc::clone(&request), Arc::clone(&context)).await;

        match &result {
            Ok(_) => self
                .bus
                .send(&LifecycleEvent::Finished(RequestInfo::new(&*request, &context))),
            Err(error) => self.bus.send(&LifecycleEvent::Failed {
                request: RequestInfo::new(&*request, &context),
                error,
            }),
        }
        result
    }
}

struct SignalledServerStreaming<Req, Resp> {
    inner: Arc<dyn ServerStreamingHandler<Req, Resp>>,
    bus: Arc<SignalBus>,
}

#[async_trait]
impl<Req, Resp> ServerStreamingHandler<Req, Resp> for SignalledServerStreaming<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> Result<ResponseStream<Resp>, Status> {
        self.bus
            .send(&LifecycleEvent::Started(RequestInfo::new(&*request, &context)));

        let responses = match self.inner.call(Arc::clone(&request), Arc::clone(&context)).await {
            Ok(responses) => responses,
            Err(error) => {
                self.bus.send(&LifecycleEvent::Failed {
                    request: RequestInfo::new(&*request, &context),
                    error: &error,
                });
                return Err(error);
            }
        };

        let stream = SignalledStream {
            inner: responses,
            bus: Arc::clone(&self.bus),
            request,
            context,
            done: false,
        };
        Ok(stream.boxed())
    }
}

/// Forwards responses and reports how the stream ended.
///
/// The stream ends after the first error. A stream dropped before it ends
/// reports nothing.
struct SignalledStream<Req, Resp> {
    inner: ResponseStream<Resp>,
    bus: Arc<SignalBus>,
    request: Arc<Req>,
    context: Arc<CallContext>,
    done: bool,
}

impl<Req, Resp> Stream for SignalledStream<Req, Resp>
where
    Req: Send + Sync + 'static,
{
    type Item = Result<Resp, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(response))) => Poll::Ready(Some(Ok(response))),
            Poll::Ready(Some(Err(error))) => {
                this.done = true;
                this.bus.send(&LifecycleEvent::Failed {
                    request: RequestInfo::new(&*this.request, &this.context),
                    error: &error,
                });
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.bus.send(&LifecycleEvent::Finished(RequestInfo::new(
                    &*this.request,
                    &this.context,
                )));
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{server_streaming_fn, unary_fn, Router};
    use crate::signals::Signal;
    use parking_lot::Mutex;

    const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";
    const COUNT: &str = "/helloworld.Greeter/Count";

    /// Bus that records the signal and method of every event.
    fn recording_bus() -> (Arc<SignalBus>, Arc<Mutex<Vec<(Signal, String)>>>) {
        let bus = Arc::new(SignalBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for signal in [Signal::RequestStarted, Signal::RequestFinished, Signal::RequestFailed] {
            let seen = Arc::clone(&seen);
            bus.connect(signal, move |event| {
                seen.lock()
                    .push((event.signal(), event.request().method().to_string()));
                Ok(())
            });
        }
        (bus, seen)
    }

    fn signals(seen: &Mutex<Vec<(Signal, String)>>) -> Vec<Signal> {
        seen.lock().iter().map(|(signal, _)| *signal).collect()
    }

    fn greeter(fail: bool) -> MethodHandler<String, String> {
        MethodHandler::Unary(Arc::new(unary_fn(
            move |request: Arc<String>, _ctx: Arc<CallContext>| async move {
                if fail {
                    Err(Status::invalid_argument("bad name"))
                } else {
                    Ok(format!("Hello, {}!", request))
                }
            },
        )))
    }

    fn counter(fail: bool) -> MethodHandler<u32, u32> {
        MethodHandler::ServerStreaming(Arc::new(server_streaming_fn(
            move |request: Arc<u32>, _ctx: Arc<CallContext>| async move {
                let mut items: Vec<Result<u32, Status>> = (0..*request).map(Ok).collect();
                if fail {
                    items.push(Err(Status::internal("stream broke")));
                    items.push(Ok(99));
                }
                Ok::<_, Status>(futures::stream::iter(items).boxed())
            },
        )))
    }

    fn ctx(method: &str) -> Arc<CallContext> {
        Arc::new(CallContext::new(method))
    }

    async fn say_hello(router: &Router) -> Result<String, Status> {
        router
            .dispatch_unary::<String, String>(
                SAY_HELLO,
                Arc::new("World".to_string()),
                ctx(SAY_HELLO),
            )
            .await
    }

    #[tokio::test]
    async fn test_unary_success_signals() {
        let (bus, seen) = recording_bus();
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(SAY_HELLO, greeter(false));

        let response = say_hello(&router).await.unwrap();

        assert_eq!(response, "Hello, World!");
        assert_eq!(
            signals(&seen),
            vec![Signal::RequestStarted, Signal::RequestFinished]
        );
        assert!(seen.lock().iter().all(|(_, method)| method == SAY_HELLO));
    }

    #[tokio::test]
    async fn test_unary_failure_signals_and_repropagates() {
        let (bus, seen) = recording_bus();
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(SAY_HELLO, greeter(true));

        let status = say_hello(&router).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "bad name");
        assert_eq!(
            signals(&seen),
            vec![Signal::RequestStarted, Signal::RequestFailed]
        );
    }

    #[tokio::test]
    async fn test_stream_success_signals_after_last_item() {
        let (bus, seen) = recording_bus();
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(COUNT, counter(false));

        let mut stream = router
            .dispatch_server_streaming::<u32, u32>(COUNT, Arc::new(3u32), ctx(COUNT))
            .await
            .unwrap();

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            assert_eq!(signals(&seen), vec![Signal::RequestStarted]);
            items.push(item.unwrap());
        }

        assert_eq!(items, vec![0, 1, 2]);
        assert_eq!(
            signals(&seen),
            vec![Signal::RequestStarted, Signal::RequestFinished]
        );
    }

    #[tokio::test]
    async fn test_stream_failure_signals_once_and_terminates() {
        let (bus, seen) = recording_bus();
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(COUNT, counter(true));

        let items: Vec<Result<u32, Status>> = router
            .dispatch_server_streaming::<u32, u32>(COUNT, Arc::new(3u32), ctx(COUNT))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 4);
        let values: Vec<u32> = items[..3].iter().map(|i| *i.as_ref().unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(items[3].as_ref().unwrap_err().message(), "stream broke");
        assert_eq!(
            signals(&seen),
            vec![Signal::RequestStarted, Signal::RequestFailed]
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_reports_no_outcome() {
        let (bus, seen) = recording_bus();
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(COUNT, counter(false));

        let mut stream = router
            .dispatch_server_streaming::<u32, u32>(COUNT, Arc::new(3u32), ctx(COUNT))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        drop(stream);

        assert_eq!(signals(&seen), vec![Signal::RequestStarted]);
    }

    #[tokio::test]
    async fn test_broken_receivers_do_not_affect_call() {
        let (bus, seen) = recording_bus();
        bus.connect(Signal::RequestStarted, |_event| Err("receiver broke".into()));
        bus.connect(Signal::RequestFinished, |_event| panic!("receiver panicked"));
        let mut router = Router::new();
        SignalWrapper::with_bus(&mut router, bus).add_method_handler(SAY_HELLO, greeter(false));

        let response = say_hello(&router).await.unwrap();

        assert_eq!(response, "Hello, World!");
        assert_eq!(
            signals(&seen),
            vec![Signal::RequestStarted, Signal::RequestFinished]
        );
    }

    #[test]
    fn test_client_streaming_passes_through() {
        use crate::grpc::{ClientStreamingHandler, HandlerKind, RequestStream};

        struct Sum;

        #[async_trait]
        impl ClientStreamingHandler<u32, u32> for Sum {
            async fn call(
                &self,
                requests: RequestStream<u32>,
                _context: Arc<CallContext>,
            ) -> Result<u32, Status> {
                let values: Vec<Result<u32, Status>> = requests.collect().await;
                values.into_iter().sum()
            }
        }

        let handler: MethodHandler<u32, u32> = MethodHandler::ClientStreaming(Arc::new(Sum));
        let original = match &handler {
            MethodHandler::ClientStreaming(inner) => Arc::clone(inner),
            _ => unreachable!(),
        };

        let wrapped = with_signals(Arc::new(SignalBus::new()), "/test.Sum/Add", handler);

        assert_eq!(wrapped.kind(), HandlerKind::ClientStreaming);
        match wrapped {
            MethodHandler::ClientStreaming(inner) => assert!(Arc::ptr_eq(&inner, &original)),
            _ => panic!("handler shape changed"),
        }
    }
}
