// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker error kinds and the `{code, msg, result, micro}` response envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error kinds per SPEC_FULL.md §7.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    Request(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("fatal startup error: {0}")]
    FatalStartup(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Request(_) => StatusCode::BAD_REQUEST,
            Self::Bus(_) => StatusCode::BAD_GATEWAY,
            Self::Stream(_) | Self::FatalStartup(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code carried in the envelope body. Per SPEC_FULL.md §6,
    /// `1` is reserved for success; every other value here mirrors the
    /// matching HTTP status so callers can branch on the envelope alone.
    pub fn code(&self) -> i64 {
        self.http_status().as_u16() as i64
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = Envelope::<()>::err(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}

/// Response envelope shared by every non-stream handler: `code == 1`
/// denotes success, any other value mirrors HTTP status semantics; `micro`
/// is wall-clock processing time for the request, in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub code: i64,
    pub msg: String,
    pub result: Option<T>,
    pub micro: i64,
}

impl<T> Envelope<T> {
    pub fn ok(result: T, micro: i64) -> Self {
        Self { code: 1, msg: "ok".to_owned(), result: Some(result), micro }
    }

    pub fn err(code: i64, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), result: None, micro: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_maps_to_401() {
        let err = BrokerError::Auth("bad token".into());
        assert_eq!(err.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), 401);
    }

    #[test]
    fn envelope_ok_has_code_one() {
        let env = Envelope::ok(42, 150);
        assert_eq!(env.code, 1);
        assert_eq!(env.result, Some(42));
        assert_eq!(env.micro, 150);
    }
}
