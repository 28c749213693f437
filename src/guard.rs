//! Tower middleware that admits, times and records outbound API calls.
//!
//! [`GuardLayer`] runs the limiter and records every call against an API
//! type. [`MetricLayer`] only feeds a custom metric: the wall time of an
//! operation, or a value taken from its response.

use crate::error::GuardError;
use crate::limiter::{Decision, RateLimiter};
use crate::monitor::Monitor;
use crate::tracker::UsageTracker;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

/// Who is making a call, as far as the limiter and tracker care.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub user: Option<String>,
    pub address: Option<String>,
}

impl CallContext {
    /// A call made on behalf of `user` with no known address.
    pub fn user(user: impl Into<String>) -> Self {
        Self { user: Some(user.into()), address: None }
    }

    /// Also limit the call under the caller's network address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

fn anonymous<Req>(_: &Req) -> CallContext {
    CallContext::default()
}

/// A layer that guards every call to the wrapped service under one API type.
///
/// Denied calls never reach the inner service. They are recorded as failures
/// with the message `"Rate limited: <reason>"` and surface as
/// [`GuardError::RateLimited`].
pub struct GuardLayer<Req> {
    tracker: UsageTracker,
    limiter: RateLimiter,
    api_type: Arc<str>,
    identity: fn(&Req) -> CallContext,
    auto_block: bool,
}

impl<Req> GuardLayer<Req> {
    /// Guard calls as `api_type`. Calls are anonymous and auto-blocking is on
    /// until configured otherwise.
    pub fn new(monitor: &Monitor, api_type: impl Into<String>) -> Self {
        Self {
            tracker: monitor.tracker().clone(),
            limiter: monitor.limiter().clone(),
            api_type: Arc::from(api_type.into()),
            identity: anonymous::<Req>,
            auto_block: true,
        }
    }

    /// Extract the caller identity from each request.
    pub fn with_identity(mut self, identity: fn(&Req) -> CallContext) -> Self {
        self.identity = identity;
        self
    }

    /// Block users whose denials cross the abuse threshold.
    pub fn auto_block(mut self, enabled: bool) -> Self {
        self.auto_block = enabled;
        self
    }
}

impl<Req> Clone for GuardLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            limiter: self.limiter.clone(),
            api_type: self.api_type.clone(),
            identity: self.identity,
            auto_block: self.auto_block,
        }
    }
}

impl<Req> fmt::Debug for GuardLayer<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardLayer")
            .field("api_type", &self.api_type)
            .field("auto_block", &self.auto_block)
            .finish_non_exhaustive()
    }
}

impl<S, Req> Layer<S> for GuardLayer<Req> {
    type Service = GuardService<S, Req>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, layer: self.clone() }
    }
}

/// Middleware service produced by [`GuardLayer`].
pub struct GuardService<S, Req> {
    inner: S,
    layer: GuardLayer<Req>,
}

impl<S: Clone, Req> Clone for GuardService<S, Req> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, Req> fmt::Debug for GuardService<S, Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardService").field("inner", &self.inner).field("layer", &self.layer).finish()
    }
}

impl<S, Req> Service<Req> for GuardService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = (self.layer.identity)(&req);
        let api_type = self.layer.api_type.clone();
        let user = ctx.user.as_deref();

        let decision = self.layer.limiter.is_rate_limited(&api_type, user, ctx.address.as_deref(), None, None);
        if let Decision::Denied { reason, retry_after, .. } = decision {
            let message = format!("Rate limited: {reason}");
            self.layer.tracker.record(&api_type, user, false, None, Some(&message));
            if let (true, Some(user)) = (self.layer.auto_block, user) {
                self.layer.limiter.auto_block_if_abuse(user, &api_type);
            }
            let err = crate::RateLimitExceeded::new(reason, retry_after);
            return Box::pin(std::future::ready(Err(GuardError::RateLimited(err))));
        }

        // the clone may not be ready; keep the one poll_ready drove
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let tracker = self.layer.tracker.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = inner.call(req).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
            match &result {
                Ok(_) => tracker.record(&api_type, ctx.user.as_deref(), true, Some(latency_ms), None),
                Err(e) => {
                    let message = e.to_string();
                    tracker.record(&api_type, ctx.user.as_deref(), false, Some(latency_ms), Some(&message));
                }
            }
            result.map_err(GuardError::Inner)
        })
    }
}

enum Measure<Resp> {
    Elapsed,
    Value(Option<fn(&Resp) -> Option<f64>>),
}

impl<Resp> Clone for Measure<Resp> {
    fn clone(&self) -> Self {
        match self {
            Measure::Elapsed => Measure::Elapsed,
            Measure::Value(extract) => Measure::Value(*extract),
        }
    }
}

/// A layer that feeds one custom metric from every call to the wrapped service.
///
/// Built with [`response_time`](Self::response_time), it records the wall time
/// of each call in milliseconds as `<operation>_response_time`, whether or not
/// the call succeeded. Built with [`value`](Self::value), it records a value
/// taken from each successful response, or `1` per call when no extractor is
/// set or it yields nothing.
pub struct MetricLayer<Req, Resp> {
    tracker: UsageTracker,
    name: Arc<str>,
    unit: Arc<str>,
    measure: Measure<Resp>,
    identity: fn(&Req) -> CallContext,
}

impl<Req, Resp> MetricLayer<Req, Resp> {
    /// Record the duration of each call as `<operation>_response_time`.
    pub fn response_time(monitor: &Monitor, operation: &str) -> Self {
        Self {
            tracker: monitor.tracker().clone(),
            name: Arc::from(format!("{operation}_response_time")),
            unit: Arc::from("milliseconds"),
            measure: Measure::Elapsed,
            identity: anonymous::<Req>,
        }
    }

    /// Count successful calls under `name`, in `count` units.
    pub fn value(monitor: &Monitor, name: impl Into<String>) -> Self {
        Self {
            tracker: monitor.tracker().clone(),
            name: Arc::from(name.into()),
            unit: Arc::from("count"),
            measure: Measure::Value(None),
            identity: anonymous::<Req>,
        }
    }

    /// Take the recorded value from each response instead of counting.
    ///
    /// Has no effect on a [`response_time`](Self::response_time) layer.
    pub fn with_extractor(mut self, extract: fn(&Resp) -> Option<f64>) -> Self {
        if let Measure::Value(slot) = &mut self.measure {
            *slot = Some(extract);
        }
        self
    }

    /// Override the recorded unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Arc::from(unit.into());
        self
    }

    /// Attribute each sample to the user extracted from the request.
    pub fn with_identity(mut self, identity: fn(&Req) -> CallContext) -> Self {
        self.identity = identity;
        self
    }
}

impl<Req, Resp> Clone for MetricLayer<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            name: self.name.clone(),
            unit: self.unit.clone(),
            measure: self.measure.clone(),
            identity: self.identity,
        }
    }
}

impl<Req, Resp> fmt::Debug for MetricLayer<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricLayer")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

impl<S, Req, Resp> Layer<S> for MetricLayer<Req, Resp> {
    type Service = MetricService<S, Req, Resp>;

    fn layer(&self, service: S) -> Self::Service {
        MetricService { inner: service, layer: self.clone() }
    }
}

/// Middleware service produced by [`MetricLayer`].
pub struct MetricService<S, Req, Resp> {
    inner: S,
    layer: MetricLayer<Req, Resp>,
}

impl<S: Clone, Req, Resp> Clone for MetricService<S, Req, Resp> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, Req, Resp> fmt::Debug for MetricService<S, Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricService").field("inner", &self.inner).field("layer", &self.layer).finish()
    }
}

impl<S, Req, Resp> Service<Req> for MetricService<S, Req, Resp>
where
    S: Service<Req, Response = Resp> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Resp, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let user = (self.layer.identity)(&req).user;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = inner.call(req).await;
            let value = match (&layer.measure, &result) {
                (Measure::Elapsed, _) => Some(started.elapsed().as_secs_f64() * 1_000.0),
                (Measure::Value(extract), Ok(resp)) => Some(extract.and_then(|f| f(resp)).unwrap_or(1.0)),
                (Measure::Value(_), Err(_)) => None,
            };
            if let Some(value) = value {
                layer.tracker.record_custom_metric(&layer.name, value, Some(&layer.unit), user.as_deref());
            }
            result
        })
    }
}
