//! # Request size
//!
//! Measures the wire size of a request without taking its body away from the
//! handlers further down the chain.
use crate::Error;
use actix_http::{h1, header::HeaderMap, Payload};
use actix_web::{dev::ServiceRequest, web::Bytes, web::BytesMut, HttpMessage as _};
use futures_util::StreamExt as _;

/// Bytes added per header value for the `": "` separator.
const HEADER_SEPARATOR_LEN: usize = 2;

/// Header size as `name: value` pairs, counting the name once per value.
pub(crate) fn header_size(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + HEADER_SEPARATOR_LEN + value.len())
        .sum()
}

/// Total request size in bytes: every header pair plus the full body.
///
/// The payload is buffered and put back so later extractors see the body from
/// the start. On a read error the payload is left empty and nothing is
/// measured.
pub(crate) async fn measure_request_size(req: &mut ServiceRequest) -> Result<i64, Error> {
    let mut payload = req.take_payload();
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }

    let size = header_size(req.headers()) + body.len();
    req.set_payload(replay_payload(body.freeze()));

    Ok(i64::try_from(size).unwrap_or(i64::MAX))
}

fn replay_payload(body: Bytes) -> Payload {
    let (_, mut payload) = h1::Payload::create(true);
    if !body.is_empty() {
        payload.unread_data(body);
    }
    Payload::from(payload)
}
