//! Per-call context handed to every handler.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{Code, Status};
use tracing::debug;

/// Call context for a single RPC.
///
/// Holds the method path, the client metadata and the abort slot. It is
/// shared between the interceptors and the business handler of one call.
#[derive(Debug)]
pub struct CallContext {
    /// Full method path, e.g. `/helloworld.Greeter/SayHello`
    method: String,
    /// Client supplied metadata
    metadata: MetadataMap,
    /// Peer address when the transport knows it
    remote_addr: Option<SocketAddr>,
    /// Status recorded by [`CallContext::abort`]
    aborted: Mutex<Option<(Code, String)>>,
}

impl CallContext {
    /// Create a context with empty metadata.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            metadata: MetadataMap::new(),
            remote_addr: None,
            aborted: Mutex::new(None),
        }
    }

    /// Replace the client metadata.
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the peer address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Split a tonic request into its message and a call context.
    pub fn from_request<T>(method: impl Into<String>, request: tonic::Request<T>) -> (T, Self) {
        let remote_addr = request.remote_addr();
        let (metadata, _extensions, message) = request.into_parts();

        let mut context = Self::new(method).with_metadata(metadata);
        context.remote_addr = remote_addr;
        (message, context)
    }

    /// The full method path of this call.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw client metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// The peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Look up an ASCII metadata value by name.
    ///
    /// Missing keys, binary keys and values that are not visible ASCII all
    /// resolve to `None`.
    pub fn metadata_value(&self, name: &str) -> Option<String> {
        self.metadata
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// Ordered `(name, value)` pairs of the ASCII client metadata.
    pub fn invocation_metadata(&self) -> Vec<(String, String)> {
        self.metadata
            .iter()
            .filter_map(|entry| match entry {
                KeyAndValueRef::Ascii(key, value) => value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_owned(), v.to_owned())),
                KeyAndValueRef::Binary(..) => None,
            })
            .collect()
    }

    /// Abort the call with a status code and message.
    ///
    /// The status is recorded on the context and returned so the caller can
    /// end the call with `return Err(ctx.abort(..))`.
    pub fn abort(&self, code: Code, message: impl Into<String>) -> Status {
        let message = message.into();
        debug!(method = %self.method, code = ?code, message = %message, "Aborting call");

        *self.aborted.lock() = Some((code, message.clone()));
        Status::new(code, message)
    }

    /// The status recorded by [`CallContext::abort`], if any.
    pub fn aborted(&self) -> Option<(Code, String)> {
        self.aborted.lock().clone()
    }

    /// Whether the call has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.lock().is_some()
    }
}
