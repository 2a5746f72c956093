use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    PayloadTooLarge(String),
    Internal(String),
}

impl ApiError {
    pub fn invalid_credentials() -> Self {
        ApiError::Unauthorized("INVALID_CREDENTIALS", "Username or password is incorrect".into())
    }

    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    /// Map a sqlx error onto the API surface.
    ///
    /// Constraint violations and `RAISE EXCEPTION` from the stored functions
    /// are client errors; everything else is logged and reported as internal.
    pub fn db(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("23505") => return ApiError::Conflict("ALREADY_EXISTS", message),
                Some("23503") => return ApiError::BadRequest("REFERENCE_NOT_FOUND", message),
                Some("23514") => return ApiError::BadRequest("CONSTRAINT_VIOLATION", message),
                Some("P0001") => return ApiError::BadRequest("REJECTED", message),
                Some("P0002") => return ApiError::NotFound("NOT_FOUND", message),
                _ => {}
            }
        }
        tracing::error!(error = %e, "database error");
        ApiError::Internal(format!("db error: {e}"))
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Forbidden(code, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::PayloadTooLarge(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                ApiError::to_error_response("PAYLOAD_TOO_LARGE", &msg),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response("INTERNAL", &msg),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_variant() {
        let cases = [
            (ApiError::session_expired(), StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("FORBIDDEN", "no".into()), StatusCode::FORBIDDEN),
            (ApiError::validation("bad"), StatusCode::BAD_REQUEST),
            (ApiError::not_found("patient"), StatusCode::NOT_FOUND),
            (ApiError::Conflict("X", "y".into()), StatusCode::CONFLICT),
            (ApiError::PayloadTooLarge("big".into()), StatusCode::PAYLOAD_TOO_LARGE),
            (ApiError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn non_database_errors_are_internal() {
        let err = ApiError::db(sqlx::Error::RowNotFound);
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[test]
    fn not_found_message_names_the_entity() {
        match ApiError::not_found("radiograph") {
            ApiError::NotFound(code, msg) => {
                assert_eq!(code, "NOT_FOUND");
                assert_eq!(msg, "radiograph not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
