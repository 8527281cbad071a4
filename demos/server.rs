use actix_web::{
    dev::ServiceRequest, http::StatusCode, web, App, HttpRequest, HttpResponse, HttpServer,
};
use actix_web_request_telemetry::{
    html, record_handler_error, RequestTelemetry, TemplateEngine, TemplateError,
};
use opentelemetry::global;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::SdkTracerProvider,
};
use std::{io, sync::Arc};

struct Greeting;

impl TemplateEngine for Greeting {
    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, TemplateError> {
        match name {
            "user.html" => Ok(format!("<h1>Hello user {}!</h1>", data["id"])),
            other => Err(format!("unknown template {other}").into()),
        }
    }
}

async fn user(req: HttpRequest, path: web::Path<u32>) -> HttpResponse {
    let id = path.into_inner();
    if id == 0 {
        record_handler_error(&req, "user 0 is reserved");
    }
    html(&req, StatusCode::OK, "user.html", &serde_json::json!({ "id": id }))
}

async fn health() -> &'static str {
    "ok"
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer_provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build())
        .build();
    global::set_meter_provider(meter_provider.clone());

    // Providers are resolved from `global` here, once.
    let telemetry = RequestTelemetry::builder("demo-server")
        .with_filter(|req: &ServiceRequest| req.path() != "/health")
        .build();
    let engine: Arc<dyn TemplateEngine> = Arc::new(Greeting);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(engine.clone()))
            .wrap(telemetry.clone())
            .route("/users/{id}", web::get().to(user))
            .route("/health", web::get().to(health))
    })
    .bind("127.0.0.1:8080")?
    .run()
    .await?;

    if let Err(err) = tracer_provider.shutdown() {
        eprintln!("tracer provider shutdown failed: {err}");
    }
    if let Err(err) = meter_provider.shutdown() {
        eprintln!("meter provider shutdown failed: {err}");
    }
    Ok(())
}
