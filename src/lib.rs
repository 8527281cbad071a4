//! # Actix Web Request Telemetry
//!
//! [OpenTelemetry](https://opentelemetry.io/) request tracing and metrics for
//! [Actix Web](https://actix.rs/).
//!
//! * Server requests are traced and measured by the [`RequestTelemetry`]
//!   middleware.
//! * Template rendering can be traced with [`html`].
//!
//! For every request that passes the configured filters the middleware:
//!
//! * continues the upstream trace found in the request headers,
//! * starts a server span named after the matched route,
//! * records `http.server.request.duration` (ms),
//!   `http.server.request.body.size`, `http.server.response.body.size` and
//!   `http.server.active_requests`,
//! * leaves the request body readable by the handlers.
//!
//! ### Server middleware example:
//! ```no_run
//! use actix_web::{dev::ServiceRequest, web, App, HttpServer};
//! use actix_web_request_telemetry::RequestTelemetry;
//!
//! async fn index() -> &'static str {
//!     "Hello world!"
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     // Install tracer and meter providers with `opentelemetry::global`
//!     // first, or pass them to the builder.
//!     let telemetry = RequestTelemetry::builder("users-api")
//!         .with_filter(|req: &ServiceRequest| req.path() != "/health")
//!         .build();
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(telemetry.clone())
//!             .service(web::resource("/users/{id}").to(index))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
#![deny(missing_docs, unreachable_pub, missing_debug_implementations)]

mod error;
mod middleware;
mod render;
mod util;

pub use {
    error::{set_error_handler, Error},
    middleware::config::RequestTelemetryBuilder,
    middleware::span_name::{MethodRouteFormatter, SpanNameFormatter},
    middleware::telemetry::{
        record_handler_error, request_context, ActiveInstruments, RequestTelemetry,
        RequestTelemetryMiddleware,
    },
    render::{html, TemplateEngine, TemplateError},
};
