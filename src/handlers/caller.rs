// Caller extraction
//
// Builds the explicit `Caller` value the core works with. Credential
// validation happens upstream (the auth proxy sets `x-user-id` only after
// verifying a token); this layer only translates headers, it never makes
// trust decisions.

use actix_web::HttpRequest;
use sha2::{Digest, Sha256};

use crate::models::Caller;

const USER_HEADER: &str = "x-user-id";
const ANON_HEADER: &str = "x-anon-id";

/// Resolve the caller identity for a request.
pub fn caller_from_request(req: &HttpRequest) -> Caller {
    let user_id = header_value(req, USER_HEADER);
    let anon_id = header_value(req, ANON_HEADER);

    let ip_hash = req
        .connection_info()
        .realip_remote_addr()
        .map(|ip| hash_hex(ip));
    let ua_hash = header_value(req, "user-agent").map(|ua| hash_hex(&ua));

    Caller {
        authenticated: user_id.is_some(),
        user_id,
        anon_id,
        ip_hash,
        ua_hash,
    }
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn hash_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
