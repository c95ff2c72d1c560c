//! Wire-level request/response DTOs for the HTTP surface, plus the
//! `BrokerError → HTTP status` mapping named in the error handling design.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker_common::{BrokerError, Instance};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub challenge: String,
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub user: String,
}

/// Fields are `Option` (rather than bare `u16`/`u32`/etc.) so a genuinely
/// absent field deserializes successfully and is caught by
/// [`AddChallengeRequest::missing_field`] as a 400, instead of axum's `Json`
/// extractor rejecting the body outright with a 422 before handler code ever
/// runs.
#[derive(Debug, Default, Deserialize)]
pub struct AddChallengeRequest {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub lifetime: Option<u64>,
    pub mem_limit: Option<u32>,
    pub user_limit: Option<u32>,
    #[serde(default)]
    pub can_prestart: bool,
}

impl AddChallengeRequest {
    /// Returns the name of the first missing required field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.name.as_deref().unwrap_or("").is_empty() {
            return Some("name");
        }
        if self.port.unwrap_or(0) == 0 {
            return Some("port");
        }
        if self.mem_limit.unwrap_or(0) == 0 {
            return Some("mem_limit");
        }
        if self.user_limit.unwrap_or(0) == 0 {
            return Some("user_limit");
        }
        None
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub container_id: String,
    pub challenge: String,
    pub external_port: u16,
    pub started_at: u64,
    pub users: Vec<String>,
    pub user_limit: u32,
}

impl From<Instance> for InstanceResponse {
    fn from(inst: Instance) -> Self {
        Self {
            container_id: inst.container_id,
            challenge: inst.challenge,
            external_port: inst.external_port,
            started_at: inst.started_at,
            users: inst.users,
            user_limit: inst.user_limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub current_instances: u64,
    pub total_instances: u64,
    pub current_users: u64,
    pub challenges: usize,
}

/// Local wrapper around [`BrokerError`] so this crate can implement
/// `IntoResponse` on it (the orphan rule forbids doing so directly on a type
/// and trait both defined elsewhere).
#[derive(Debug)]
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::UnknownChallenge(_) => StatusCode::NOT_FOUND,
            BrokerError::AlreadyAssigned(_) => StatusCode::FORBIDDEN,
            BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
            BrokerError::MissingField(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::BuildError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::NoPortAvailable => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_reports_first_gap() {
        let req = AddChallengeRequest {
            name: Some("echo".into()),
            port: Some(0),
            lifetime: Some(600),
            mem_limit: Some(64),
            user_limit: Some(4),
            can_prestart: false,
        };
        assert_eq!(req.missing_field(), Some("port"));
    }

    #[test]
    fn absent_field_is_also_reported_as_missing() {
        let req = AddChallengeRequest {
            name: Some("echo".into()),
            port: None,
            lifetime: Some(600),
            mem_limit: Some(64),
            user_limit: Some(4),
            can_prestart: false,
        };
        assert_eq!(req.missing_field(), Some("port"));
    }

    #[test]
    fn complete_request_has_no_missing_field() {
        let req = AddChallengeRequest {
            name: Some("echo".into()),
            port: Some(9000),
            lifetime: Some(600),
            mem_limit: Some(64),
            user_limit: Some(4),
            can_prestart: true,
        };
        assert_eq!(req.missing_field(), None);
    }
}
