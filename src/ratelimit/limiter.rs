//! Admission decisions for rate limited handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tonic::{Code, Status};
use tracing::{debug, instrument, trace};

use super::backend::CounterStore;
use super::counter::CallCounter;
use super::fingerprint::{cache_key, resolve_values};
use super::rules::RateLimitRule;
use super::window::{current_window_end, Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::grpc::{
    CallContext, MethodHandler, ResponseStream, ServerStreamingHandler, UnaryHandler,
};

/// Outcome of recording one call against one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Calls recorded in the current window, including this one
    pub count: u64,
    /// Seconds until the current window ends
    pub seconds_remaining: u64,
}

/// Fixed-window rate limiter over a shared counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Clone)]
pub struct RateLimiter {
    counter: CallCounter,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the system clock.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_counter(CallCounter::new(store), clock)
    }

    /// Create a rate limiter from a preconfigured counter.
    pub fn with_counter(counter: CallCounter, clock: Arc<dyn Clock>) -> Self {
        Self { counter, clock }
    }

    /// The counter backing this limiter.
    pub fn counter(&self) -> &CallCounter {
        &self.counter
    }

    /// Record a call against `rule` and report the window state.
    ///
    /// `identity` names the decorated operation and is the counter group
    /// unless the rule sets its own. Errors only come from custom key
    /// extractors.
    pub async fn evaluate<Req: Serialize>(
        &self,
        identity: &str,
        request: &Req,
        context: &CallContext,
        rule: &RateLimitRule<Req>,
    ) -> std::result::Result<Evaluation, Status> {
        let group = rule.group_name().unwrap_or(identity);
        let values = resolve_values(request, context, rule.keys())?;

        let now = self.clock.now();
        let window = current_window_end(rule.time_period(), now);
        let key = cache_key(group, &values, window);

        let count = self.counter.record(&key, rule.time_period()).await;

        trace!(group = %group, window, key = %key, count, "Recorded call");

        Ok(Evaluation {
            count,
            seconds_remaining: window.saturating_sub(now),
        })
    }

    /// Evaluate every rule in order and abort the call on the first one
    /// that is over its limit. Rules after the rejecting one are not
    /// recorded.
    #[instrument(skip_all, fields(identity = %identity, method = %context.method()))]
    pub async fn check<Req: Serialize>(
        &self,
        identity: &str,
        request: &Req,
        context: &CallContext,
        rules: &[RateLimitRule<Req>],
    ) -> std::result::Result<(), Status> {
        for rule in rules {
            let evaluation = self.evaluate(identity, request, context, rule).await?;

            if evaluation.count > rule.max_calls() {
                debug!(
                    count = evaluation.count,
                    max_calls = rule.max_calls(),
                    seconds_remaining = evaluation.seconds_remaining,
                    "Rate limit exceeded"
                );
                return Err(context.abort(
                    Code::ResourceExhausted,
                    exhausted_message(rule, &evaluation),
                ));
            }
        }

        Ok(())
    }

    /// Wrap a unary or server-streaming handler with rate limit rules.
    ///
    /// Client-streaming and bidirectional handlers cannot be keyed on their
    /// request before it is consumed and are rejected.
    pub fn limit_method<Req, Resp>(
        self: &Arc<Self>,
        identity: impl Into<String>,
        rules: Vec<RateLimitRule<Req>>,
        handler: MethodHandler<Req, Resp>,
    ) -> Result<MethodHandler<Req, Resp>>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let identity = identity.into();
        match handler {
            MethodHandler::Unary(inner) => Ok(MethodHandler::Unary(Arc::new(RateLimited::new(
                Arc::clone(self),
                identity,
                rules,
                inner,
            )))),
            MethodHandler::ServerStreaming(inner) => Ok(MethodHandler::ServerStreaming(Arc::new(
                RateLimited::new(Arc::clone(self), identity, rules, inner),
            ))),
            other => Err(TollgateError::Config(format!(
                "{} handlers cannot be rate limited ({})",
                other.kind(),
                identity
            ))),
        }
    }
}

/// Message returned to clients whose call was rejected.
fn exhausted_message<Req>(rule: &RateLimitRule<Req>, evaluation: &Evaluation) -> String {
    format!(
        "Reached limit of {} calls per {} seconds. Resource will be available in {} seconds.",
        rule.max_calls(),
        rule.time_period(),
        evaluation.seconds_remaining
    )
}

/// A handler guarded by an ordered list of rate limit rules.
pub struct RateLimited<H, Req> {
    limiter: Arc<RateLimiter>,
    identity: String,
    rules: Vec<RateLimitRule<Req>>,
    inner: H,
}

impl<H, Req> RateLimited<H, Req> {
    /// Guard `inner` with `rules`, counted under `identity` by default.
    pub fn new(
        limiter: Arc<RateLimiter>,
        identity: impl Into<String>,
        rules: Vec<RateLimitRule<Req>>,
        inner: H,
    ) -> Self {
        Self {
            limiter,
            identity: identity.into(),
            rules,
            inner,
        }
    }

    /// The counter group used by rules without their own.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl<H, Req, Resp> UnaryHandler<Req, Resp> for RateLimited<H, Req>
where
    H: UnaryHandler<Req, Resp>,
    Req: Serialize + Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> std::result::Result<Resp, Status> {
        self.limiter
            .check(&self.identity, request.as_ref(), &context, &self.rules)
            .await?;
        self.inner.call(request, context).await
    }
}

#[async_trait]
impl<H, Req, Resp> ServerStreamingHandler<Req, Resp> for RateLimited<H, Req>
where
    H: ServerStreamingHandler<Req, Resp>,
    Req: Serialize + Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(
        &self,
        request: Arc<Req>,
        context: Arc<CallContext>,
    ) -> std::result::Result<ResponseStream<Resp>, Status> {
        self.limiter
            .check(&self.identity, request.as_ref(), &context, &self.rules)
            .await?;
        self.inner.call(request, context).await
    }
}
