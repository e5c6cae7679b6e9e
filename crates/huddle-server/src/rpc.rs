//! Request and response frames of the JSON-RPC dialect spoken on `/ws`.

use huddle_engine::RoomError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

/// `{ id, success, result?, error?: { code, message } }`
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes on the wire, serialized as `"NOT_FOUND"` and so on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    MethodNotFound,
    InvalidParams,
    Unauthenticated,
    NotFound,
    InternalError,
}

impl From<&RoomError> for ErrorCode {
    fn from(err: &RoomError) -> Self {
        match err {
            RoomError::NotFound(_) => Self::NotFound,
            RoomError::Validation(_) => Self::InvalidParams,
            RoomError::Unauthenticated(_) => Self::Unauthenticated,
            RoomError::Persistence(_) | RoomError::Subscription(_) | RoomError::Capacity(_) => {
                Self::InternalError
            }
        }
    }
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(id, ErrorCode::MethodNotFound, format!("Unknown method '{method}'"))
    }

    pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InvalidParams, message)
    }

    pub fn unauthenticated(id: Option<Value>) -> Self {
        Self::error(id, ErrorCode::Unauthenticated, "Authentication required")
    }

    /// Reply to a frame that was not a request at all. There is no id to echo.
    pub fn parse_error() -> Self {
        Self::error(None, ErrorCode::ParseError, "Malformed request")
    }

    /// Internal failures are reported without their detail.
    pub fn from_room_error(id: Option<Value>, err: &RoomError) -> Self {
        if err.is_internal() {
            Self::error(id, ErrorCode::InternalError, "Internal error")
        } else {
            Self::error(id, ErrorCode::from(err), err.to_string())
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Typed access to a request's `params` object.
#[derive(Clone, Copy)]
pub struct Params<'a>(&'a Value);

impl<'a> Params<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self(value)
    }

    /// A string parameter that must be present.
    pub fn str(&self, key: &str) -> Result<&'a str, String> {
        self.opt_str(key)
            .ok_or_else(|| format!("'{key}' must be a string"))
    }

    pub fn opt_str(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }
}
