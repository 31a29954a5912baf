//! gRPC call plumbing: call context, handler traits and the dispatch table.

mod context;
mod handler;
mod server;

pub use context::CallContext;
pub use handler::{
    server_streaming_fn, unary_fn, ClientStreamingHandler, HandlerKind, HandlerRegistry,
    MethodHandler, RequestStream, ResponseStream, ServerStreamingFn, ServerStreamingHandler,
    StreamingHandler, UnaryFn, UnaryHandler,
};
pub use server::Router;
