//! Lifecycle signals around rate limited handlers.

use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Code, Request, Status};

use tollgate::grpc::{unary_fn, CallContext, HandlerRegistry, MethodHandler, Router};
use tollgate::ratelimit::{ManualClock, MemoryStore, RateLimitRule, RateLimiter};
use tollgate::signals::{Signal, SignalBus, SignalWrapper};

const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";

#[derive(Clone, PartialEq, prost::Message, serde::Serialize)]
struct HelloRequest {
    #[prost(string, tag = "1")]
    name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct HelloReply {
    #[prost(string, tag = "1")]
    message: String,
}

/// What a receiver saw for one event.
#[derive(Debug, Clone, PartialEq)]
struct Seen {
    signal: Signal,
    name: Option<String>,
    code: Option<Code>,
}

fn recording_bus() -> (Arc<SignalBus>, Arc<Mutex<Vec<Seen>>>) {
    let bus = Arc::new(SignalBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for signal in [Signal::RequestStarted, Signal::RequestFinished, Signal::RequestFailed] {
        let seen = Arc::clone(&seen);
        bus.connect(signal, move |event| {
            seen.lock().push(Seen {
                signal: event.signal(),
                name: event
                    .request()
                    .message::<HelloRequest>()
                    .map(|request| request.name.clone()),
                code: event.error().map(Status::code),
            });
            Ok(())
        });
    }
    (bus, seen)
}

fn greeter() -> MethodHandler<HelloRequest, HelloReply> {
    MethodHandler::Unary(Arc::new(unary_fn(
        |request: Arc<HelloRequest>, _ctx: Arc<CallContext>| async move {
            Ok::<_, Status>(HelloReply {
                message: format!("Hello, {}!", request.name),
            })
        },
    )))
}

fn limited_router(bus: Arc<SignalBus>) -> Router {
    let clock = ManualClock::new(14);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let limiter = Arc::new(RateLimiter::with_clock(store, Arc::new(clock)));
    let rules = vec![RateLimitRule::<HelloRequest>::new(1, 10).unwrap()];

    let mut router = Router::new();
    SignalWrapper::with_bus(&mut router, bus).add_method_handler(
        SAY_HELLO,
        limiter.limit_method("Greeter.SayHello", rules, greeter()).unwrap(),
    );
    router
}

async fn say_hello(router: &Router, name: &str) -> Result<HelloReply, Status> {
    router
        .call_unary::<HelloRequest, HelloReply>(
            SAY_HELLO,
            Request::new(HelloRequest { name: name.to_string() }),
        )
        .await
        .map(|response| response.into_inner())
}

#[tokio::test]
async fn test_rate_limited_call_reports_failure() {
    let (bus, seen) = recording_bus();
    let router = limited_router(bus);

    let reply = say_hello(&router, "World").await.unwrap();
    assert_eq!(reply.message, "Hello, World!");
    let status = say_hello(&router, "World").await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);

    let started = Seen {
        signal: Signal::RequestStarted,
        name: Some("World".to_string()),
        code: None,
    };
    assert_eq!(
        *seen.lock(),
        vec![
            started.clone(),
            Seen {
                signal: Signal::RequestFinished,
                name: Some("World".to_string()),
                code: None,
            },
            started,
            Seen {
                signal: Signal::RequestFailed,
                name: Some("World".to_string()),
                code: Some(Code::ResourceExhausted),
            },
        ]
    );
}

#[tokio::test]
async fn test_receiver_sees_aborted_context() {
    let bus = Arc::new(SignalBus::new());
    let aborted = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&aborted);
    bus.connect(Signal::RequestFailed, move |event| {
        recorded.lock().push(event.request().context().aborted());
        Ok(())
    });
    let router = limited_router(bus);

    say_hello(&router, "World").await.unwrap();
    say_hello(&router, "World").await.unwrap_err();

    let aborted = aborted.lock();
    assert_eq!(aborted.len(), 1);
    assert_eq!(
        aborted[0],
        Some((
            Code::ResourceExhausted,
            "Reached limit of 1 calls per 10 seconds. Resource will be available in 6 seconds."
                .to_string()
        ))
    );
}

#[tokio::test]
async fn test_failing_receiver_does_not_change_outcome() {
    let (bus, seen) = recording_bus();
    bus.connect(Signal::RequestStarted, |_event| Err("audit log unavailable".into()));
    let router = limited_router(bus);

    assert!(say_hello(&router, "World").await.is_ok());
    assert_eq!(
        say_hello(&router, "World").await.unwrap_err().code(),
        Code::ResourceExhausted
    );
    assert_eq!(seen.lock().len(), 4);
}

#[tokio::test]
async fn test_default_wrapper_uses_global_bus() {
    const PING: &str = "/health.Health/Ping";

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    SignalBus::global().connect(Signal::RequestFinished, move |event| {
        if event.request().method() == PING {
            recorded.lock().push(event.signal());
        }
        Ok(())
    });

    let mut router = Router::new();
    SignalWrapper::new(&mut router).add_method_handler(
        PING,
        MethodHandler::Unary(Arc::new(unary_fn(
            |_request: Arc<()>, _ctx: Arc<CallContext>| async move { Ok::<_, Status>(()) },
        ))),
    );

    router
        .call_unary::<(), ()>(PING, Request::new(()))
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec![Signal::RequestFinished]);
}
