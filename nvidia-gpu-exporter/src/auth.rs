//! HTTP basic authentication for the exporter endpoints.
//!
//! Passwords are stored as hex SHA-256 digests and compared in constant time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Set of users allowed to reach the endpoints.
#[derive(Clone)]
pub struct BasicAuth {
    users: Arc<BTreeMap<String, [u8; 32]>>,
}

impl BasicAuth {
    /// Build from usernames mapped to hex encoded SHA-256 password digests.
    pub fn from_hashes(users: &BTreeMap<String, String>) -> Result<Self, hex::FromHexError> {
        let mut parsed = BTreeMap::new();
        for (user, hash) in users {
            let mut digest = [0u8; 32];
            hex::decode_to_slice(hash.trim(), &mut digest)?;
            parsed.insert(user.clone(), digest);
        }

        Ok(Self {
            users: Arc::new(parsed),
        })
    }

    /// Check one username and plaintext password.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some(expected) = self.users.get(username) else {
            return false;
        };

        let digest = Sha256::digest(password.as_bytes());
        expected.as_slice().ct_eq(digest.as_slice()).into()
    }

    /// Check the value of an `Authorization` header.
    pub fn authorize(&self, authorization: Option<&str>) -> bool {
        let Some(encoded) = authorization.and_then(|value| value.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };

        match credentials.split_once(':') {
            Some((username, password)) => self.verify(username, password),
            None => false,
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Middleware rejecting requests without valid credentials.
pub async fn require_basic_auth(
    State(auth): State<BasicAuth>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if auth.authorize(authorization) {
        return next.run(request).await;
    }

    debug!(uri = %request.uri(), "Rejecting unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"nvidia-gpu-exporter\"")],
        "Unauthorized\n",
    )
        .into_response()
}
