//! Fuzz testing for inbound header parsing.
//!
//! Every parser that sees client-controlled header text must never panic:
//!
//! - `bearer_token`: `Authorization` credential extraction
//! - `identity::resolve`: `X-Consumer-ID` validation
//! - `correlation::resolve`: `X-Correlation-ID` reuse
//! - `CidrRange::parse`: `TRUSTED_PROXIES` entries
//! - `ClientIpResolver::resolve`: `X-Forwarded-For` handling
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_headers -- -max_total_time=60
//! ```

#![no_main]

use api_gateway::filters::auth::{Credential, bearer_token};
use api_gateway::filters::ip::{CidrRange, ClientIpResolver};
use api_gateway::filters::{correlation, identity};
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, HeaderValue};
use axum::http::{HeaderMap, Request};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = HeaderValue::from_bytes(data) else {
        return;
    };

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value.clone());
    headers.insert("x-consumer-id", value.clone());
    headers.insert("x-correlation-id", value.clone());
    headers.insert("x-forwarded-for", value);

    if let Credential::Bearer(token) = bearer_token(&headers) {
        assert!(!token.is_empty());
        assert!(!token.contains(' '));
    }

    let consumer = identity::resolve(None, &headers);
    assert!(consumer == "anonymous" || identity::is_valid_consumer_id(&consumer));

    assert!(!correlation::resolve(&headers).trim().is_empty());

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = CidrRange::parse(text);
    }

    let mut req = Request::new(Body::empty());
    *req.headers_mut() = headers;
    let _ = ClientIpResolver::default().resolve(&req);
});
