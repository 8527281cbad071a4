//! # Configuration
//!
//! Options for [`RequestTelemetry`] are collected by
//! [`RequestTelemetryBuilder`] and resolved once, when the middleware is
//! built, into an immutable [`Config`] shared by every worker and request.
use super::{get_scope, span_name::SpanNameFormatter, telemetry::RequestTelemetry};
use crate::{error::handle_error, util::RequestHeaderCarrier, Error};
use actix_web::{dev::ServiceRequest, http::header::HeaderMap};
use opentelemetry::{
    global::{self, BoxedTracer},
    metrics::{Histogram, Meter, MeterProvider, SyncInstrument, UpDownCounter},
    propagation::TextMapPropagator,
    trace::{Tracer, TracerProvider},
    Context, InstrumentationScope, KeyValue,
};
use opentelemetry_semantic_conventions::metric::{
    HTTP_SERVER_ACTIVE_REQUESTS, HTTP_SERVER_REQUEST_BODY_SIZE, HTTP_SERVER_REQUEST_DURATION,
    HTTP_SERVER_RESPONSE_BODY_SIZE,
};
use std::{fmt, sync::Arc};

pub(crate) type Filter = Arc<dyn Fn(&ServiceRequest) -> bool + Send + Sync>;
type TracerFactory = Box<dyn FnOnce(InstrumentationScope) -> BoxedTracer + Send + Sync>;

/// Name, description and unit of a metric instrument.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InstrumentDescriptor {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) unit: &'static str,
}

const REQUEST_DURATION: InstrumentDescriptor = InstrumentDescriptor {
    name: HTTP_SERVER_REQUEST_DURATION,
    description: "Measures the duration of inbound HTTP requests.",
    unit: "ms",
};

const REQUEST_SIZE: InstrumentDescriptor = InstrumentDescriptor {
    name: HTTP_SERVER_REQUEST_BODY_SIZE,
    description: "Measures the size of HTTP request messages (uncompressed).",
    unit: "By",
};

const RESPONSE_SIZE: InstrumentDescriptor = InstrumentDescriptor {
    name: HTTP_SERVER_RESPONSE_BODY_SIZE,
    description: "Measures the size of HTTP response messages (uncompressed).",
    unit: "By",
};

const ACTIVE_REQUESTS: InstrumentDescriptor = InstrumentDescriptor {
    name: HTTP_SERVER_ACTIVE_REQUESTS,
    description: "Measures the number of handled HTTP requests.",
    unit: "{count}",
};

const MAX_INSTRUMENT_NAME_LEN: usize = 255;
const MAX_INSTRUMENT_UNIT_LEN: usize = 63;

/// Check a descriptor against the OpenTelemetry instrument naming rules.
pub(crate) fn validate_instrument(descriptor: &InstrumentDescriptor) -> Result<(), Error> {
    let invalid = |reason| Error::InvalidInstrument {
        name: descriptor.name,
        reason,
    };

    let mut chars = descriptor.name.chars();
    match chars.next() {
        None => return Err(invalid("name must not be empty")),
        Some(first) if !first.is_ascii_alphabetic() => {
            return Err(invalid("name must start with a letter"))
        }
        _ => {}
    }
    if descriptor.name.len() > MAX_INSTRUMENT_NAME_LEN {
        return Err(invalid("name must be at most 255 characters"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/')) {
        return Err(invalid("name contains invalid characters"));
    }
    if descriptor.unit.len() > MAX_INSTRUMENT_UNIT_LEN {
        return Err(invalid("unit must be at most 63 characters"));
    }
    if !descriptor.unit.is_ascii() {
        return Err(invalid("unit must be ASCII"));
    }

    Ok(())
}

/// Instrument that drops every measurement.
struct NoopInstrument;

impl<T> SyncInstrument<T> for NoopInstrument {
    fn measure(&self, _measurement: T, _attributes: &[KeyValue]) {}
}

pub(crate) fn f64_histogram(meter: &Meter, descriptor: InstrumentDescriptor) -> Histogram<f64> {
    match validate_instrument(&descriptor) {
        Ok(()) => meter
            .f64_histogram(descriptor.name)
            .with_description(descriptor.description)
            .with_unit(descriptor.unit)
            .build(),
        Err(err) => {
            handle_error(err);
            Histogram::new(Arc::new(NoopInstrument))
        }
    }
}

pub(crate) fn i64_up_down_counter(
    meter: &Meter,
    descriptor: InstrumentDescriptor,
) -> UpDownCounter<i64> {
    match validate_instrument(&descriptor) {
        Ok(()) => meter
            .i64_up_down_counter(descriptor.name)
            .with_description(descriptor.description)
            .with_unit(descriptor.unit)
            .build(),
        Err(err) => {
            handle_error(err);
            UpDownCounter::new(Arc::new(NoopInstrument))
        }
    }
}

/// The metric instruments recorded for each request.
#[derive(Clone)]
pub(crate) struct Instruments {
    pub(crate) request_duration: Histogram<f64>,
    pub(crate) request_size: UpDownCounter<i64>,
    pub(crate) response_size: UpDownCounter<i64>,
    pub(crate) active_requests: UpDownCounter<i64>,
}

impl Instruments {
    fn new(meter: &Meter) -> Self {
        Instruments {
            request_duration: f64_histogram(meter, REQUEST_DURATION),
            request_size: i64_up_down_counter(meter, REQUEST_SIZE),
            response_size: i64_up_down_counter(meter, RESPONSE_SIZE),
            active_requests: i64_up_down_counter(meter, ACTIVE_REQUESTS),
        }
    }
}

/// Where upstream trace context is read from.
pub(crate) enum PropagatorSource {
    /// Whatever propagator is installed globally when the request arrives.
    Global,
    Custom(Arc<dyn TextMapPropagator + Send + Sync>),
}

impl PropagatorSource {
    /// Extract upstream context on top of the current context.
    ///
    /// Missing or malformed headers yield the current context unchanged.
    pub(crate) fn extract(&self, headers: &HeaderMap) -> Context {
        let carrier = RequestHeaderCarrier::new(headers);
        match self {
            PropagatorSource::Global => {
                global::get_text_map_propagator(|propagator| propagator.extract(&carrier))
            }
            PropagatorSource::Custom(propagator) => propagator.extract(&carrier),
        }
    }
}

/// Resolved middleware configuration.
pub(crate) struct Config {
    pub(crate) service: String,
    pub(crate) tracer: Arc<BoxedTracer>,
    pub(crate) meter: Meter,
    pub(crate) propagator: PropagatorSource,
    pub(crate) filters: Vec<Filter>,
    pub(crate) span_name_formatter: Option<Arc<dyn SpanNameFormatter + Send + Sync>>,
    pub(crate) instruments: Instruments,
    pub(crate) disable_errors_on_metrics: bool,
}

impl Config {
    /// `true` when every filter accepts the request.
    pub(crate) fn accepts(&self, req: &ServiceRequest) -> bool {
        self.filters.iter().all(|filter| filter(req))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("service", &self.service)
            .field("filters", &self.filters.len())
            .field("span_name_formatter", &self.span_name_formatter.is_some())
            .field("disable_errors_on_metrics", &self.disable_errors_on_metrics)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RequestTelemetry`].
///
/// Options apply in call order; setting the same option twice keeps the last
/// value, while filters accumulate. Providers left unset are taken from
/// [`opentelemetry::global`] when [`build`](Self::build) runs; see
/// [`with_propagator`](Self::with_propagator) for the propagator.
///
/// ```
/// use actix_web::dev::ServiceRequest;
/// use actix_web_request_telemetry::RequestTelemetry;
///
/// let telemetry = RequestTelemetry::builder("users-api")
///     .with_filter(|req: &ServiceRequest| req.path() != "/health")
///     .with_disable_errors_on_metrics(true)
///     .build();
/// ```
pub struct RequestTelemetryBuilder {
    service: String,
    tracer_factory: Option<TracerFactory>,
    meter_provider: Option<Arc<dyn MeterProvider + Send + Sync>>,
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    filters: Vec<Filter>,
    span_name_formatter: Option<Arc<dyn SpanNameFormatter + Send + Sync>>,
    disable_errors_on_metrics: bool,
}

impl fmt::Debug for RequestTelemetryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTelemetryBuilder")
            .field("service", &self.service)
            .field("tracer_provider", &self.tracer_factory.is_some())
            .field("meter_provider", &self.meter_provider.is_some())
            .field("propagator", &self.propagator.is_some())
            .field("filters", &self.filters.len())
            .field("span_name_formatter", &self.span_name_formatter.is_some())
            .field("disable_errors_on_metrics", &self.disable_errors_on_metrics)
            .finish()
    }
}

impl RequestTelemetryBuilder {
    /// Create a new `RequestTelemetryBuilder` for the named service.
    pub fn new(service: impl Into<String>) -> Self {
        RequestTelemetryBuilder {
            service: service.into(),
            tracer_factory: None,
            meter_provider: None,
            propagator: None,
            filters: Vec::new(),
            span_name_formatter: None,
            disable_errors_on_metrics: false,
        }
    }

    /// Use this tracer provider instead of the global one.
    pub fn with_tracer_provider<P>(mut self, provider: P) -> Self
    where
        P: TracerProvider + Send + Sync + 'static,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        self.tracer_factory = Some(Box::new(move |scope: InstrumentationScope| {
            BoxedTracer::new(Box::new(provider.tracer_with_scope(scope)))
        }));
        self
    }

    /// Use this meter provider instead of the global one.
    pub fn with_meter_provider<P>(mut self, provider: P) -> Self
    where
        P: MeterProvider + Send + Sync + 'static,
    {
        self.meter_provider = Some(Arc::new(provider));
        self
    }

    /// Use this propagator instead of the global one.
    ///
    /// Tracer and meter providers are resolved once in
    /// [`build`](Self::build), but the global propagator cannot be taken out
    /// of [`opentelemetry::global`]. Without this option it is looked up on
    /// every request, so a propagator installed later takes effect. Set it
    /// here to keep request handling independent of global state.
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    /// Name spans with this formatter instead of the matched route.
    pub fn with_span_name_formatter<F>(mut self, formatter: F) -> Self
    where
        F: SpanNameFormatter + Send + Sync + 'static,
    {
        self.span_name_formatter = Some(Arc::new(formatter));
        self
    }

    /// Add a request filter.
    ///
    /// Requests for which any filter returns `false` are passed through
    /// without a span or metrics.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ServiceRequest) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Keep the handler error attribute off metric data points.
    ///
    /// Error descriptions are usually unique per request; recording them on
    /// metrics can create one series per distinct error.
    pub fn with_disable_errors_on_metrics(mut self, disable: bool) -> Self {
        self.disable_errors_on_metrics = disable;
        self
    }

    /// Build the `RequestTelemetry` middleware.
    pub fn build(self) -> RequestTelemetry {
        RequestTelemetry::from_config(Arc::new(self.resolve()))
    }

    fn resolve(self) -> Config {
        let tracer = match self.tracer_factory {
            Some(factory) => factory(get_scope()),
            None => global::tracer_provider().tracer_with_scope(get_scope()),
        };
        let meter = match &self.meter_provider {
            Some(provider) => provider.meter_with_scope(get_scope()),
            None => global::meter_provider().meter_with_scope(get_scope()),
        };
        let propagator = match self.propagator {
            Some(propagator) => PropagatorSource::Custom(propagator),
            None => PropagatorSource::Global,
        };
        let instruments = Instruments::new(&meter);

        Config {
            service: self.service,
            tracer: Arc::new(tracer),
            meter,
            propagator,
            filters: self.filters,
            span_name_formatter: self.span_name_formatter,
            instruments,
            disable_errors_on_metrics: self.disable_errors_on_metrics,
        }
    }
}
