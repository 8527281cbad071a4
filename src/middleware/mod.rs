use opentelemetry::InstrumentationScope;

pub(crate) mod attributes;
pub(crate) mod config;
pub(crate) mod size;
pub(crate) mod span_name;
pub(crate) mod telemetry;

pub(crate) fn get_scope() -> InstrumentationScope {
    InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(opentelemetry_semantic_conventions::SCHEMA_URL)
        .build()
}
