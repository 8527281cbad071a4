//! # Span Name Formatter
//!
//! Name server spans from requests.
use actix_web::dev::ServiceRequest;

/// Interface for naming the server span of a request.
///
/// Returning an empty string means "no name"; the middleware then falls back
/// to `HTTP {METHOD} route not found` and records no route attribute.
///
/// # Examples
///
/// Using the built in method and route formatter:
///
/// ```
/// use actix_web::test::TestRequest;
/// use actix_web_request_telemetry::{MethodRouteFormatter, SpanNameFormatter};
///
/// let req = TestRequest::get().uri("/health").to_srv_request();
/// // Unrouted test requests have no match pattern.
/// assert_eq!(MethodRouteFormatter.format(&req), "");
/// ```
///
/// Or any closure over the request:
///
/// ```
/// use actix_web::dev::ServiceRequest;
/// use actix_web_request_telemetry::RequestTelemetry;
///
/// let telemetry = RequestTelemetry::builder("users-api")
///     .with_span_name_formatter(|req: &ServiceRequest| req.path().to_lowercase())
///     .build();
/// ```
pub trait SpanNameFormatter {
    /// Function from request to span name.
    /// e.g. GET /users/123 -> GET /users/{id}
    fn format(&self, req: &ServiceRequest) -> String;
}

impl<F> SpanNameFormatter for F
where
    F: Fn(&ServiceRequest) -> String,
{
    fn format(&self, req: &ServiceRequest) -> String {
        self(req)
    }
}

/// Names spans `{METHOD} {route}` using the matched route template.
#[derive(Clone, Copy, Debug, Default)]
pub struct MethodRouteFormatter;

impl SpanNameFormatter for MethodRouteFormatter {
    fn format(&self, req: &ServiceRequest) -> String {
        match req.match_pattern() {
            Some(route) => format!("{} {}", req.method(), route),
            None => String::new(),
        }
    }
}
