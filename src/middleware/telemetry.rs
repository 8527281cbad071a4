//! # Request Telemetry Middleware
//!
//! One middleware that traces and measures each request: it continues the
//! upstream trace, opens a server span, and records duration and size metrics
//! with an attribute set that agrees with the span on route, method and
//! status.
use super::{
    attributes::{server_request_attributes, server_request_metric_attributes, server_status},
    config::{Config, RequestTelemetryBuilder},
    size::measure_request_size,
};
use actix_web::{
    body::{BodySize, EitherBody, MessageBody},
    dev, HttpMessage as _, HttpRequest, HttpResponse,
};
use futures_util::future::{self, LocalBoxFuture};
use opentelemetry::{
    global::BoxedTracer,
    metrics::Meter,
    trace::{FutureExt as OtelFutureExt, SpanKind, Status, TraceContextExt, Tracer},
    Context, Key, KeyValue,
};
use opentelemetry_semantic_conventions::trace::{HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE};
use std::{
    cell::RefCell,
    fmt::{self, Display, Write as _},
    rc::Rc,
    sync::Arc,
    time::Instant,
};

const HANDLER_ERRORS_KEY: Key = Key::from_static_str("actix.errors");
const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// The tracer and meter of the middleware handling the current request.
///
/// Stored in the request's [`Context`], so code running inside a handler can
/// create spans and instruments from the same providers:
///
/// ```
/// use actix_web_request_telemetry::ActiveInstruments;
/// use opentelemetry::{trace::Tracer, Context};
///
/// async fn handler() -> &'static str {
///     let cx = Context::current();
///     if let Some(instruments) = cx.get::<ActiveInstruments>() {
///         let _span = instruments.tracer().start_with_context("load-user", &cx);
///     }
///     "ok"
/// }
/// ```
#[derive(Clone)]
pub struct ActiveInstruments {
    tracer: Arc<BoxedTracer>,
    meter: Meter,
}

impl ActiveInstruments {
    /// Tracer used for the request's server span.
    pub fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    /// Meter used for the request metrics.
    pub fn meter(&self) -> &Meter {
        &self.meter
    }
}

impl fmt::Debug for ActiveInstruments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveInstruments").finish_non_exhaustive()
    }
}

/// Request extension slot holding the telemetry context of the request.
///
/// The slot is shared with the middleware, so the context can be put back
/// after the request is gone from the service chain.
#[derive(Clone, Debug, Default)]
struct RequestContext(Rc<RefCell<Option<Context>>>);

/// Errors recorded by handlers that did not fail the request.
#[derive(Clone, Debug, Default)]
struct HandlerErrors(Rc<RefCell<Vec<String>>>);

/// Context of the server span for this request.
///
/// Falls back to [`Context::current`] when the request was not instrumented.
pub fn request_context(req: &HttpRequest) -> Context {
    req.extensions()
        .get::<RequestContext>()
        .and_then(|RequestContext(slot)| slot.borrow().clone())
        .unwrap_or_else(Context::current)
}

/// Record a handler error against the current request.
///
/// Recorded errors do not change the response. They are added to the server
/// span as the `actix.errors` attribute and, unless disabled with
/// [`RequestTelemetryBuilder::with_disable_errors_on_metrics`], to the
/// request metrics.
///
/// ```
/// use actix_web::{HttpRequest, HttpResponse};
/// use actix_web_request_telemetry::record_handler_error;
///
/// async fn sync_profile(req: HttpRequest) -> HttpResponse {
///     // the cache refresh failed, but the response can still be served
///     record_handler_error(&req, "profile cache refresh failed");
///     HttpResponse::Ok().finish()
/// }
/// ```
pub fn record_handler_error(req: &HttpRequest, err: impl Display) {
    let mut extensions = req.extensions_mut();
    match extensions.get::<HandlerErrors>() {
        Some(HandlerErrors(errors)) => errors.borrow_mut().push(err.to_string()),
        None => {
            extensions.insert(HandlerErrors(Rc::new(RefCell::new(vec![err.to_string()]))));
        }
    }
}

/// The request extensions published while the inner service runs.
#[derive(Debug)]
struct RequestScope {
    context: RequestContext,
    previous: Option<Context>,
    errors: HandlerErrors,
    errors_offset: usize,
    owns_errors: bool,
}

impl RequestScope {
    /// Publish `cx` as the request context and start collecting handler errors.
    fn enter(req: &dev::ServiceRequest, cx: Context) -> Self {
        let mut extensions = req.extensions_mut();
        let context = match extensions.get::<RequestContext>() {
            Some(slot) => slot.clone(),
            None => {
                let slot = RequestContext::default();
                extensions.insert(slot.clone());
                slot
            }
        };
        let (errors, owns_errors) = match extensions.get::<HandlerErrors>() {
            Some(slot) => (slot.clone(), false),
            None => {
                let slot = HandlerErrors::default();
                extensions.insert(slot.clone());
                (slot, true)
            }
        };

        let previous = context.0.replace(Some(cx));
        let errors_offset = errors.0.borrow().len();
        RequestScope {
            context,
            previous,
            errors,
            errors_offset,
            owns_errors,
        }
    }

    /// Put the previous context back and return the errors recorded since
    /// [`enter`](Self::enter).
    fn exit(&mut self) -> Vec<String> {
        *self.context.0.borrow_mut() = self.previous.take();

        let mut errors = self.errors.0.borrow_mut();
        let recorded = errors
            .get(self.errors_offset..)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        if self.owns_errors {
            errors.clear();
        }
        recorded
    }
}

fn describe_errors(errors: &[String]) -> String {
    let mut description = String::new();
    for (index, err) in errors.iter().enumerate() {
        let _ = writeln!(description, "Error #{:02}: {}", index + 1, err);
    }
    description
}

/// Bytes written for a response body, `0` while the size is unknown.
fn response_size(size: BodySize) -> i64 {
    match size {
        BodySize::Sized(len) => i64::try_from(len).unwrap_or(i64::MAX),
        _ => 0,
    }
}

/// Request tracing and metrics middleware.
///
/// `http.server.response.body.size` is taken from the response body's
/// declared size when the inner service returns. Streaming bodies have no
/// size at that point and are recorded as `0`, however many bytes are
/// written afterwards.
///
/// # Examples
///
/// ```no_run
/// use actix_web::{web, App, HttpServer};
/// use actix_web_request_telemetry::RequestTelemetry;
///
/// async fn index() -> &'static str {
///     "Hello world!"
/// }
///
/// #[actix_web::main]
/// async fn main() -> std::io::Result<()> {
///     // Install tracer and meter providers with `opentelemetry::global`
///     // before building the middleware.
///     let telemetry = RequestTelemetry::new("users-api");
///
///     HttpServer::new(move || {
///         App::new()
///             .wrap(telemetry.clone())
///             .service(web::resource("/users/{id}").to(index))
///     })
///     .bind("127.0.0.1:8080")?
///     .run()
///     .await
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RequestTelemetry {
    config: Arc<Config>,
}

impl RequestTelemetry {
    /// Middleware for `service` using the global providers and propagator.
    pub fn new(service: impl Into<String>) -> Self {
        RequestTelemetryBuilder::new(service).build()
    }

    /// Configure a middleware for `service`.
    pub fn builder(service: impl Into<String>) -> RequestTelemetryBuilder {
        RequestTelemetryBuilder::new(service)
    }

    pub(crate) fn from_config(config: Arc<Config>) -> Self {
        RequestTelemetry { config }
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

impl<S, B> dev::Transform<S, dev::ServiceRequest> for RequestTelemetry
where
    S: dev::Service<
            dev::ServiceRequest,
            Response = dev::ServiceResponse<B>,
            Error = actix_web::Error,
        > + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = dev::ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RequestTelemetryMiddleware<S>;
    type InitError = ();
    type Future = future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ok(RequestTelemetryMiddleware {
            service: Rc::new(service),
            config: Arc::clone(&self.config),
        })
    }
}

/// Request telemetry middleware service.
#[allow(missing_debug_implementations)]
pub struct RequestTelemetryMiddleware<S> {
    service: Rc<S>,
    config: Arc<Config>,
}

impl<S, B> dev::Service<dev::ServiceRequest> for RequestTelemetryMiddleware<S>
where
    S: dev::Service<
            dev::ServiceRequest,
            Response = dev::ServiceResponse<B>,
            Error = actix_web::Error,
        > + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = dev::ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    dev::forward_ready!(service);

    fn call(&self, mut req: dev::ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            if !config.accepts(&req) {
                tracing::debug!(path = req.path(), "request filtered out of telemetry");
                return service
                    .call(req)
                    .await
                    .map(dev::ServiceResponse::map_into_left_body);
            }

            let request_size = match measure_request_size(&mut req).await {
                Ok(size) => size,
                Err(err) => {
                    tracing::warn!(error = %err, path = req.path(), "aborting request");
                    let res = HttpResponse::InternalServerError()
                        .json(serde_json::json!({ "error": "failed to read request body" }));
                    return Ok(req.into_response(res).map_into_right_body());
                }
            };

            let parent_cx = config.propagator.extract(req.headers());

            let route = req.match_pattern().filter(|route| !route.is_empty());
            let span_name = match &config.span_name_formatter {
                Some(formatter) => formatter.format(&req),
                None => route.clone().unwrap_or_default(),
            };
            let span_name = if span_name.is_empty() {
                format!("HTTP {} route not found", req.method())
            } else {
                span_name
            };

            let mut span_attributes = server_request_attributes(&config.service, &req);
            let mut metric_attributes = server_request_metric_attributes(&config.service, &req);
            if let Some(route) = route {
                let route_attribute = KeyValue::new(HTTP_ROUTE, route);
                span_attributes.push(route_attribute.clone());
                metric_attributes.push(route_attribute);
            }

            let span = config
                .tracer
                .span_builder(span_name)
                .with_kind(SpanKind::Server)
                .with_attributes(span_attributes)
                .start_with_context(&*config.tracer, &parent_cx);
            let cx = parent_cx.with_span(span).with_value(ActiveInstruments {
                tracer: Arc::clone(&config.tracer),
                meter: config.meter.clone(),
            });

            let scope = RequestScope::enter(&req, cx.clone());
            let mut finalizer = RequestFinalizer::new(
                Arc::clone(&config),
                cx.clone(),
                scope,
                metric_attributes,
                request_size,
            );

            match service.call(req).with_context(cx).await {
                Ok(res) => {
                    let failure = res.response().error().map(ToString::to_string);
                    finalizer.finish(
                        res.status().as_u16(),
                        response_size(res.response().body().size()),
                        failure,
                    );
                    Ok(res.map_into_left_body())
                }
                Err(err) => {
                    let status = err.as_response_error().status_code();
                    finalizer.finish(status.as_u16(), 0, Some(err.to_string()));
                    Err(err)
                }
            }
        })
    }
}

/// Closes the server span, records metrics and restores the request scope
/// for one request.
///
/// Dropping an unfinished finalizer (the handler panicked or the request
/// future was cancelled) finishes it with an unknown status.
struct RequestFinalizer {
    config: Arc<Config>,
    cx: Context,
    scope: RequestScope,
    metric_attributes: Vec<KeyValue>,
    request_size: i64,
    start: Instant,
    finished: bool,
}

impl RequestFinalizer {
    fn new(
        config: Arc<Config>,
        cx: Context,
        scope: RequestScope,
        metric_attributes: Vec<KeyValue>,
        request_size: i64,
    ) -> Self {
        RequestFinalizer {
            config,
            cx,
            scope,
            metric_attributes,
            request_size,
            start: Instant::now(),
            finished: false,
        }
    }

    /// `status` of `0` means no response status was ever set. `failure` is the
    /// error the request failed with, after any errors handlers recorded.
    fn finish(&mut self, status: u16, response_size: i64, failure: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut errors = self.scope.exit();
        errors.extend(failure);

        // Float division keeps sub-millisecond precision.
        let elapsed = self.start.elapsed().as_nanos() as f64 / NANOS_PER_MILLI;
        let span = self.cx.span();
        let mut metric_attributes = std::mem::take(&mut self.metric_attributes);

        if status > 0 {
            span.set_status(server_status(status));
            let status_attribute = KeyValue::new(HTTP_RESPONSE_STATUS_CODE, status as i64);
            span.set_attribute(status_attribute.clone());
            metric_attributes.push(status_attribute);
        } else {
            span.set_status(Status::error("request aborted before a response was sent"));
        }

        if !errors.is_empty() {
            let errors_attribute = KeyValue::new(HANDLER_ERRORS_KEY, describe_errors(&errors));
            span.set_attribute(errors_attribute.clone());
            if !self.config.disable_errors_on_metrics {
                metric_attributes.push(errors_attribute);
            }
        }

        let instruments = &self.config.instruments;
        instruments
            .request_duration
            .record(elapsed, &metric_attributes);
        instruments
            .request_size
            .add(self.request_size, &metric_attributes);
        instruments
            .response_size
            .add(response_size, &metric_attributes);
        instruments.active_requests.add(1, &metric_attributes);

        span.end();
    }
}

impl Drop for RequestFinalizer {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(0, 0, None);
        }
    }
}
