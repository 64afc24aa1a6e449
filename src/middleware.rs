//! Request gating middleware for axum.
//!
//! Wraps a router with a per-identity budget check: each request is mapped
//! to an identity, charged against that identity's window, and either
//! forwarded with informational headers or refused with the configured
//! status and a retry hint.
//!
//! # Example
//!
//! ```rust,ignore
//! use floodgate::middleware::RateLimitLayer;
//!
//! let layer = RateLimitLayer::builder()
//!     .max(100)
//!     .duration(std::time::Duration::from_secs(60))
//!     .build()?;
//!
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(layer);
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use redis::Client;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::clock;
use crate::config::{Driver, FailureMode, GateConfig, HeaderNames};
use crate::error::{FloodgateError, Result};
use crate::limiter::{Limit, Limiter, LimiterOptions, MemoryLimiter, MemoryStore, RedisLimiter};

/// Function that names the identity behind a request.
///
/// Returning `None` waves the request through ungated, mirroring clients
/// the gate cannot attribute (no peer address, no credential). An empty
/// string is treated the same as `None`.
pub type IdExtractor = Arc<dyn Fn(&Request<Body>) -> Option<String> + Send + Sync>;

/// Predicate over a request, used for allowlist and blocklist decisions.
pub type Predicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// The store shared by every request passing through one gate.
#[derive(Clone)]
enum Store {
    Memory(MemoryStore),
    Redis(Arc<Client>),
}

/// Everything a gate needs at request time, shared across clones.
struct GateState {
    config: GateConfig,
    store: Store,
    status: StatusCode,
    header_remaining: HeaderName,
    header_reset: HeaderName,
    header_total: HeaderName,
    id: IdExtractor,
    allowlist: Option<Predicate>,
    blocklist: Option<Predicate>,
}

impl GateState {
    /// Charge one call against the identity's window.
    async fn evaluate(&self, id: &str) -> Result<Limit> {
        let options = LimiterOptions::new(
            id,
            self.config.max,
            self.config.duration(),
            self.config.namespace.clone(),
        )?;
        match &self.store {
            Store::Memory(store) => MemoryLimiter::new(options, store.clone()).evaluate().await,
            Store::Redis(client) => {
                RedisLimiter::new(options, Arc::clone(client)).evaluate().await
            }
        }
    }
}

/// A refused call, carrying everything needed to render the refusal.
///
/// When `reject_with_error` is on, a copy rides in the response extensions
/// so outer layers can observe or re-render the refusal instead of passing
/// the prepared response along untouched.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    /// Status the refusal renders with
    pub status: StatusCode,
    /// Body text, configured or generated
    pub body: String,
    /// Whole seconds until the window frees up
    pub retry_after_secs: i64,
    /// Informational headers, empty when headers are disabled
    pub headers: Vec<(HeaderName, String)>,
}

impl fmt::Display for RateLimitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.body)
    }
}

impl std::error::Error for RateLimitRejection {}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.retry_after_secs.to_string()) {
            headers.insert(RETRY_AFTER, value);
        }
        apply_headers(headers, &self.headers);
        response
    }
}

/// Rate limiting layer for tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<GateState>,
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("config", &self.state.config)
            .finish_non_exhaustive()
    }
}

impl RateLimitLayer {
    /// Create a new builder with default settings.
    pub fn builder() -> RateLimitLayerBuilder {
        RateLimitLayerBuilder::default()
    }

    /// Create a layer from configuration.
    pub fn from_config(config: GateConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Builder for a [`RateLimitLayer`].
#[derive(Default)]
pub struct RateLimitLayerBuilder {
    config: GateConfig,
    memory_store: Option<MemoryStore>,
    redis_client: Option<Arc<Client>>,
    id: Option<IdExtractor>,
    allowlist: Option<Predicate>,
    blocklist: Option<Predicate>,
}

impl RateLimitLayerBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Select the store driver.
    pub fn driver(mut self, driver: Driver) -> Self {
        self.config.driver = driver;
        self
    }

    /// Maximum number of calls allowed per window.
    pub fn max(mut self, max: u64) -> Self {
        self.config.max = max;
        self
    }

    /// Window length.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Prefix for store keys.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Status returned when a call is refused.
    pub fn status(mut self, status: u16) -> Self {
        self.config.status = status;
        self
    }

    /// Override for the refusal body.
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.config.error_message = Some(message.into());
        self
    }

    /// Suppress the informational headers.
    pub fn disable_headers(mut self, disable: bool) -> Self {
        self.config.disable_headers = disable;
        self
    }

    /// Attach refusals to the response extensions.
    pub fn reject_with_error(mut self, reject: bool) -> Self {
        self.config.reject_with_error = reject;
        self
    }

    /// Behavior when the store is unreachable.
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.config.failure_mode = mode;
        self
    }

    /// Names for the informational headers.
    pub fn header_names(mut self, headers: HeaderNames) -> Self {
        self.config.headers = headers;
        self
    }

    /// Connection URL for the Redis driver.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = Some(url.into());
        self
    }

    /// Share an existing in-process store between gates.
    pub fn memory_store(mut self, store: MemoryStore) -> Self {
        self.memory_store = Some(store);
        self
    }

    /// Share an existing Redis client between gates.
    pub fn redis_client(mut self, client: Arc<Client>) -> Self {
        self.redis_client = Some(client);
        self
    }

    /// How requests are mapped to identities. Defaults to the peer IP.
    pub fn id_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Request<Body>) -> Option<String> + Send + Sync + 'static,
    {
        self.id = Some(Arc::new(extractor));
        self
    }

    /// Requests matching this predicate bypass the gate entirely.
    pub fn allowlist<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.allowlist = Some(Arc::new(predicate));
        self
    }

    /// Requests matching this predicate are refused outright with 403.
    pub fn blocklist<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.blocklist = Some(Arc::new(predicate));
        self
    }

    /// Validate the settings and produce the layer.
    pub fn build(self) -> Result<RateLimitLayer> {
        let config = self.config;

        if config.max == 0 {
            return Err(FloodgateError::Config(
                "gate max must be at least 1".to_string(),
            ));
        }
        if config.duration_ms == 0 {
            return Err(FloodgateError::Config(
                "gate duration must be positive".to_string(),
            ));
        }

        let status = StatusCode::from_u16(config.status).map_err(|_| {
            FloodgateError::Config(format!("invalid rejection status: {}", config.status))
        })?;

        let header_remaining = parse_header_name(&config.headers.remaining)?;
        let header_reset = parse_header_name(&config.headers.reset)?;
        let header_total = parse_header_name(&config.headers.total)?;

        let store = match config.driver {
            Driver::Memory => Store::Memory(self.memory_store.unwrap_or_default()),
            Driver::Redis => match (self.redis_client, config.redis_url.as_deref()) {
                (Some(client), _) => Store::Redis(client),
                (None, Some(url)) => {
                    let client = Client::open(url).map_err(|e| {
                        FloodgateError::Config(format!("invalid Redis URL: {}", e))
                    })?;
                    Store::Redis(Arc::new(client))
                }
                (None, None) => {
                    return Err(FloodgateError::Config(
                        "redis driver requires a redis_url or a shared client".to_string(),
                    ))
                }
            },
        };

        Ok(RateLimitLayer {
            state: Arc::new(GateState {
                config,
                store,
                status,
                header_remaining,
                header_reset,
                header_total,
                id: self.id.unwrap_or_else(|| Arc::new(peer_ip)),
                allowlist: self.allowlist,
                blocklist: self.blocklist,
            }),
        })
    }
}

/// Rate limiting service wrapping an inner service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<GateState>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Unattributable requests are not gated.
            let id = (state.id)(&request).filter(|id| !id.is_empty());
            let Some(id) = id else {
                return inner.call(request).await;
            };

            // Blocklist wins over allowlist, and neither touches the store.
            if let Some(blocklist) = &state.blocklist {
                if blocklist(&request) {
                    debug!(id = %id, "Refusing blocklisted identity");
                    return Ok(StatusCode::FORBIDDEN.into_response());
                }
            }
            if let Some(allowlist) = &state.allowlist {
                if allowlist(&request) {
                    return inner.call(request).await;
                }
            }

            let limit = match state.evaluate(&id).await {
                Ok(limit) => limit,
                Err(e) => {
                    return match state.config.failure_mode {
                        FailureMode::Open => {
                            warn!(id = %id, error = %e, "Limit store unavailable, waving request through");
                            inner.call(request).await
                        }
                        FailureMode::Closed => {
                            error!(id = %id, error = %e, "Limit store unavailable, refusing request");
                            Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                        }
                    };
                }
            };

            // The reported allowance accounts for the call being admitted
            // right now, floored at zero.
            let calls = if limit.remaining > 0 {
                limit.remaining - 1
            } else {
                0
            };

            let mut info_headers = Vec::new();
            if !state.config.disable_headers {
                info_headers.push((state.header_remaining.clone(), calls.to_string()));
                info_headers.push((state.header_reset.clone(), limit.reset.to_string()));
                info_headers.push((state.header_total.clone(), limit.total.to_string()));
            }

            if limit.remaining > 0 {
                let mut response = inner.call(request).await?;
                apply_headers(response.headers_mut(), &info_headers);
                return Ok(response);
            }

            debug!(id = %id, reset = limit.reset, "Rate limit exceeded");

            let now_ms = clock::now_micros() as f64 / 1_000.0;
            let delta_ms = (limit.reset * 1_000.0 - now_ms).max(0.0) as u64;
            let retry_after_secs = (limit.reset - clock::now_seconds()).floor() as i64;
            let body = state.config.error_message.clone().unwrap_or_else(|| {
                format!("Rate limit exceeded, retry in {}.", humanize(delta_ms))
            });

            let rejection = RateLimitRejection {
                status: state.status,
                body,
                retry_after_secs,
                headers: info_headers,
            };

            let mut response = rejection.clone().into_response();
            if state.config.reject_with_error {
                response.extensions_mut().insert(rejection);
            }
            Ok(response)
        })
    }
}

/// Default identity: the connecting peer's IP address.
fn peer_ip(request: &Request<Body>) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| FloodgateError::Config(format!("invalid header name: {}", name)))
}

fn apply_headers(headers: &mut HeaderMap, pairs: &[(HeaderName, String)]) {
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name.clone(), value);
        }
    }
}

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Render a millisecond span the way a person would say it, rounding to
/// the largest fitting unit.
fn humanize(ms: u64) -> String {
    fn scaled(ms: u64, unit: u64, name: &str) -> String {
        let count = (ms as f64 / unit as f64).round() as u64;
        // Pluralize from one and a half units up, so "1 minute" covers
        // everything that still rounds to one.
        if ms >= unit + unit / 2 {
            format!("{} {}s", count, name)
        } else {
            format!("{} {}", count, name)
        }
    }

    if ms >= DAY_MS {
        scaled(ms, DAY_MS, "day")
    } else if ms >= HOUR_MS {
        scaled(ms, HOUR_MS, "hour")
    } else if ms >= MINUTE_MS {
        scaled(ms, MINUTE_MS, "minute")
    } else if ms >= SECOND_MS {
        scaled(ms, SECOND_MS, "second")
    } else {
        format!("{} ms", ms)
    }
}
