//! Framework-independent request handlers.
//!
//! Handlers take the caller identity plus already-parsed input and return an
//! [`ApiResponse`] carrying an HTTP status and a JSON body. Binding them to a web
//! server is left to the embedding application.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::policy::Denial;

pub mod v1;

pub use v1::CourseApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Created,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalServerError => 500,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() < 300
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: Status,
    pub body: Value,
}

impl ApiResponse {
    /// Serialize `body`; a serialization failure becomes a 500 response
    pub fn json<T: Serialize>(status: Status, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => {
                error!(error = %e, "Failed to serialize response body");
                Self::message(Status::InternalServerError, "Internal server error.")
            }
        }
    }

    pub fn message(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: Status::NoContent,
            body: Value::Null,
        }
    }

    pub fn denied(denial: Denial) -> Self {
        match denial {
            Denial::Unauthenticated => Self::message(
                Status::Unauthorized,
                "Authentication credentials were not provided.",
            ),
            Denial::Forbidden => Self::message(
                Status::Forbidden,
                "You do not have permission to perform this action.",
            ),
        }
    }

    /// Text of the `message` field, if the body has one
    pub fn message_text(&self) -> Option<&str> {
        self.body.get("message").and_then(Value::as_str)
    }
}
