//! # Template rendering
//!
//! Trace template rendering as a child of the request's server span.
use crate::middleware::{get_scope, telemetry::ActiveInstruments};
use crate::request_context;
use actix_web::{
    http::{header::ContentType, StatusCode},
    web, HttpRequest, HttpResponse,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Status, TraceContextExt, Tracer, TracerProvider},
    Context, KeyValue,
};
use serde::Serialize;
use std::{
    any::Any,
    error::Error as StdError,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;

const RENDER_SPAN_NAME: &str = "actix.renderer.html";
const TEMPLATE_NAME_KEY: &str = "template.name";
const TEMPLATE_FAILURE: &str = "template failure";

/// Error returned by a [`TemplateEngine`].
pub type TemplateError = Box<dyn StdError + Send + Sync>;

/// A template engine used by [`html`].
///
/// Register the engine as `web::Data<dyn TemplateEngine>`:
///
/// ```
/// use actix_web::{web, App};
/// use actix_web_request_telemetry::{TemplateEngine, TemplateError};
/// use std::sync::Arc;
///
/// struct Greeting;
///
/// impl TemplateEngine for Greeting {
///     fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, TemplateError> {
///         Ok(format!("<h1>{name}: {}</h1>", data["user"]))
///     }
/// }
///
/// let engine: Arc<dyn TemplateEngine> = Arc::new(Greeting);
/// let app = App::new().app_data(web::Data::from(engine));
/// ```
pub trait TemplateEngine: Send + Sync {
    /// Render template `name` with `data`.
    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, TemplateError>;
}

#[derive(Debug, Error)]
enum RenderError {
    #[error("error rendering template:{template}: {message}")]
    Panicked { template: String, message: String },
    #[error("error rendering template:{template}: {cause}")]
    Failed {
        template: String,
        cause: TemplateError,
    },
    #[error("error rendering template:{template}: invalid data: {cause}")]
    InvalidData {
        template: String,
        cause: serde_json::Error,
    },
    #[error("error rendering template:{template}: no template engine registered")]
    MissingEngine { template: String },
}

/// Render template `name` into an HTML response, traced as a child span.
///
/// The span uses the tracer of the [`RequestTelemetry`] middleware that
/// handled `req`, or the global tracer when the request was not
/// instrumented. A panic raised by the engine is recorded on the span and
/// then resumed unchanged.
///
/// [`RequestTelemetry`]: crate::RequestTelemetry
///
/// ```no_run
/// use actix_web::{http::StatusCode, HttpRequest, HttpResponse};
/// use actix_web_request_telemetry::html;
///
/// async fn profile(req: HttpRequest) -> HttpResponse {
///     html(&req, StatusCode::OK, "profile.html", &serde_json::json!({ "user": "ferris" }))
/// }
/// ```
pub fn html<T>(req: &HttpRequest, status: StatusCode, name: &str, data: &T) -> HttpResponse
where
    T: Serialize + ?Sized,
{
    let parent_cx = request_context(req);
    let span = match parent_cx.get::<ActiveInstruments>() {
        Some(instruments) => start_render_span(instruments.tracer(), name, &parent_cx),
        None => {
            tracing::debug!(template = name, "no request tracer, rendering with global tracer");
            let tracer = global::tracer_provider().tracer_with_scope(get_scope());
            start_render_span(&tracer, name, &parent_cx)
        }
    };
    let cx = parent_cx.with_span(span);
    let span = cx.span();

    let rendered = {
        let _guard = cx.clone().attach();
        panic::catch_unwind(AssertUnwindSafe(|| render_template(req, name, data)))
    };

    match rendered {
        Ok(Ok(body)) => {
            span.end();
            HttpResponse::build(status)
                .content_type(ContentType::html())
                .body(body)
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "template rendering failed");
            span.record_error(&err);
            span.set_status(Status::error(TEMPLATE_FAILURE));
            span.end();
            HttpResponse::InternalServerError().finish()
        }
        Err(payload) => {
            let err = RenderError::Panicked {
                template: name.to_string(),
                message: panic_message(payload.as_ref()),
            };
            span.record_error(&err);
            span.set_status(Status::error(TEMPLATE_FAILURE));
            span.end();
            panic::resume_unwind(payload)
        }
    }
}

fn start_render_span(tracer: &BoxedTracer, name: &str, parent_cx: &Context) -> BoxedSpan {
    tracer
        .span_builder(RENDER_SPAN_NAME)
        .with_attributes([KeyValue::new(TEMPLATE_NAME_KEY, name.to_string())])
        .start_with_context(tracer, parent_cx)
}

fn render_template<T>(req: &HttpRequest, name: &str, data: &T) -> Result<String, RenderError>
where
    T: Serialize + ?Sized,
{
    let engine = req
        .app_data::<web::Data<dyn TemplateEngine>>()
        .ok_or_else(|| RenderError::MissingEngine {
            template: name.to_string(),
        })?;
    let data = serde_json::to_value(data).map_err(|cause| RenderError::InvalidData {
        template: name.to_string(),
        cause,
    })?;

    engine
        .render(name, &data)
        .map_err(|cause| RenderError::Failed {
            template: name.to_string(),
            cause,
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
