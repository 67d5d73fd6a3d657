// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{Json, http::StatusCode, response::IntoResponse};
use relay::RelayError;
use serde::Serialize;
use snafu::Snafu;
use strum::EnumProperty;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code:    String,
    pub message: String,
}

#[derive(Debug, Snafu, strum_macros::EnumProperty)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("Invalid argument: {reason}"))]
    #[strum(props(code = "invalid_argument"))]
    InvalidArgument { reason: String },

    #[snafu(display("Unauthorized"))]
    #[strum(props(code = "unauthorized"))]
    Unauthorized,

    #[snafu(display("Service unavailable: {reason}"))]
    #[strum(props(code = "unavailable"))]
    Unavailable { reason: String },

    #[snafu(display("Internal error: {source}"))]
    #[strum(props(code = "internal"))]
    Internal { source: RelayError },
}

impl ApiError {
    /// Stable machine-readable code sent in the body.
    #[must_use]
    pub fn code(&self) -> &'static str { self.get_str("code").unwrap_or("unknown") }

    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ErrorBody {
            code:    self.code().to_string(),
            message: self.to_string(),
        });
        (self.http_status(), body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let err = ApiError::InvalidArgument {
            reason: "source_key is required".to_string(),
        };
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);

        let err = ApiError::Internal {
            source: RelayError::QueueClosed,
        };
        assert_eq!(err.code(), "internal");
        assert_eq!(err.to_string(), "Internal error: Task queue is closed");
    }
}
