//! # Request attributes
//!
//! Derives the semantic-convention attribute sets recorded for a server
//! request. Spans receive the full set; metrics receive a reduced set that
//! leaves out per-request values which would explode metric cardinality.
use crate::util::{http_method_str, http_scheme, protocol_version, split_host_port};
use actix_web::{dev::ServiceRequest, http::header};
use opentelemetry::{trace::Status, KeyValue};
use opentelemetry_semantic_conventions::trace::{
    CLIENT_ADDRESS, HTTP_REQUEST_METHOD, NETWORK_PEER_ADDRESS, NETWORK_PROTOCOL_NAME,
    NETWORK_PROTOCOL_VERSION, SERVER_ADDRESS, SERVER_PORT, URL_PATH, URL_QUERY, URL_SCHEME,
    USER_AGENT_ORIGINAL,
};

/// Attributes shared by the span and metric sets.
fn common_attributes(service: &str, req: &ServiceRequest) -> Vec<KeyValue> {
    let conn_info = req.connection_info();
    let (host, port) = split_host_port(conn_info.host());
    let server_address = if service.is_empty() { host } else { service };

    let mut attributes = Vec::with_capacity(12);
    attributes.push(KeyValue::new(
        HTTP_REQUEST_METHOD,
        http_method_str(req.method()),
    ));
    attributes.push(KeyValue::new(URL_SCHEME, http_scheme(conn_info.scheme())));
    attributes.push(KeyValue::new(SERVER_ADDRESS, server_address.to_string()));
    if let Some(port) = port {
        attributes.push(KeyValue::new(SERVER_PORT, port as i64));
    }
    attributes.push(KeyValue::new(NETWORK_PROTOCOL_NAME, "http"));
    attributes.push(KeyValue::new(
        NETWORK_PROTOCOL_VERSION,
        protocol_version(req.version()),
    ));

    attributes
}

/// Span attributes for an inbound request.
pub(crate) fn server_request_attributes(service: &str, req: &ServiceRequest) -> Vec<KeyValue> {
    let mut attributes = common_attributes(service, req);

    attributes.push(KeyValue::new(URL_PATH, req.path().to_string()));
    let query = req.query_string();
    if !query.is_empty() {
        attributes.push(KeyValue::new(URL_QUERY, query.to_string()));
    }
    if let Some(client) = req.connection_info().realip_remote_addr() {
        attributes.push(KeyValue::new(CLIENT_ADDRESS, client.to_string()));
    }
    if let Some(peer) = req.peer_addr() {
        attributes.push(KeyValue::new(NETWORK_PEER_ADDRESS, peer.ip().to_string()));
    }
    if let Some(user_agent) = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|s| s.to_str().ok())
    {
        attributes.push(KeyValue::new(USER_AGENT_ORIGINAL, user_agent.to_string()));
    }

    attributes
}

/// Metric attributes for an inbound request.
pub(crate) fn server_request_metric_attributes(
    service: &str,
    req: &ServiceRequest,
) -> Vec<KeyValue> {
    common_attributes(service, req)
}

/// Span status for a server response code.
///
/// Client errors are the caller's fault and leave the status unset.
pub(crate) fn server_status(code: u16) -> Status {
    match code {
        100..=499 => Status::Unset,
        500..=599 => Status::error(""),
        _ => Status::error(format!("Invalid HTTP status code {}", code)),
    }
}
