//! REST surface
//!
//! Response helpers shared by the handlers plus the ordered-collection
//! paging module. Error responses use fixed literal bodies.

pub mod collections;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Literal error bodies of the REST layer
pub const NOT_FOUND_BODY: &str = "Not Found.\n";
pub const UNAUTHORIZED_BODY: &str = "Unauthorized.\n";
pub const BAD_REQUEST_BODY: &str = "Bad Request.\n";
pub const INTERNAL_SERVER_ERROR_BODY: &str = "Internal Server Error.\n";

/// Media type of activity documents
pub const ACTIVITY_JSON: &str = "application/activity+json";

pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", ACTIVITY_JSON)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}

pub fn ok_json(body: serde_json::Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

pub fn bytes_response(content_type: &str, bytes: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response")
}

pub fn not_found() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

pub fn unauthorized() -> Response<Full<Bytes>> {
    text_response(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY)
}

pub fn bad_request() -> Response<Full<Bytes>> {
    text_response(StatusCode::BAD_REQUEST, BAD_REQUEST_BODY)
}

pub fn internal_server_error() -> Response<Full<Bytes>> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_SERVER_ERROR_BODY)
}

/// Map a domain error to its response per the REST error policy
pub fn error_response(err: &crate::error::Error) -> Response<Full<Bytes>> {
    use crate::error::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => not_found(),
        ErrorKind::BadRequest | ErrorKind::Permanent => bad_request(),
        ErrorKind::Unauthorized => unauthorized(),
        ErrorKind::Transient => internal_server_error(),
    }
}

/// Single-value query parameter lookup
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|p| p.split_once('='))
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
}

/// Minimal percent-decoding for path segments (hashlinks carry `:`)
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_literal_error_bodies() {
        let bodies = [
            (error_response(&Error::NotFound("x".into())), 404),
            (error_response(&Error::Unauthorized("x".into())), 401),
            (error_response(&Error::BadRequest("x".into())), 400),
            (error_response(&Error::transient("x")), 500),
        ];

        for (response, status) in bodies {
            assert_eq!(response.status().as_u16(), status);
        }
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("page=true&page-num=3"), "page-num"),
            Some("3")
        );
        assert_eq!(query_param(Some("page=true"), "page-num"), None);
        assert_eq!(query_param(None, "page"), None);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("hl%3AuEiAx"), "hl:uEiAx");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
