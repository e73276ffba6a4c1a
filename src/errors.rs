use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::{ErrorData, ErrorShape};

/// Boxed error returned by procedures and stream releases.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Category of a procedure error.
///
/// The wire name (`as_str`) travels in `error.data.code`; the numeric
/// JSON-RPC code and the HTTP status are derived from it through fixed
/// tables. New categories get new rows, existing rows never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The message could not be parsed.
    ParseError,
    /// The request was understood but is invalid.
    BadRequest,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Credentials are valid but not sufficient.
    Forbidden,
    /// No procedure on the requested path.
    NotFound,
    /// The procedure exists but not for the requested method.
    MethodNotSupported,
    /// The caller stopped waiting.
    Timeout,
    /// Conflicting state.
    Conflict,
    /// A precondition of the procedure was not met.
    PreconditionFailed,
    /// The input is too large.
    PayloadTooLarge,
    /// The input is well formed but semantically wrong.
    UnprocessableContent,
    /// Rate limited.
    TooManyRequests,
    /// The caller cancelled the invocation.
    ClientClosedRequest,
    /// The port closed before the invocation finished.
    Disconnected,
    /// Anything else.
    InternalServerError,
}

impl ErrorCode {
    /// Wire name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Parse a wire name, unknown names fall back to `InternalServerError`.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "PARSE_ERROR" => ErrorCode::ParseError,
            "BAD_REQUEST" => ErrorCode::BadRequest,
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "FORBIDDEN" => ErrorCode::Forbidden,
            "NOT_FOUND" => ErrorCode::NotFound,
            "METHOD_NOT_SUPPORTED" => ErrorCode::MethodNotSupported,
            "TIMEOUT" => ErrorCode::Timeout,
            "CONFLICT" => ErrorCode::Conflict,
            "PRECONDITION_FAILED" => ErrorCode::PreconditionFailed,
            "PAYLOAD_TOO_LARGE" => ErrorCode::PayloadTooLarge,
            "UNPROCESSABLE_CONTENT" => ErrorCode::UnprocessableContent,
            "TOO_MANY_REQUESTS" => ErrorCode::TooManyRequests,
            "CLIENT_CLOSED_REQUEST" => ErrorCode::ClientClosedRequest,
            "DISCONNECTED" => ErrorCode::Disconnected,
            _ => ErrorCode::InternalServerError,
        }
    }

    /// Numeric JSON-RPC code carried in `error.code`.
    pub fn json_rpc_code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::BadRequest => -32600,
            ErrorCode::NotFound | ErrorCode::MethodNotSupported => -32601,
            ErrorCode::InternalServerError => -32603,
            _ => -32603,
        }
    }

    /// HTTP status, diagnostic metadata only.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ParseError | ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::MethodNotSupported => 405,
            ErrorCode::Timeout => 408,
            ErrorCode::Conflict => 409,
            ErrorCode::PreconditionFailed => 412,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::UnprocessableContent => 422,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::ClientClosedRequest => 499,
            ErrorCode::Disconnected => 503,
            ErrorCode::InternalServerError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured procedure error.
///
/// Both sides of a port see the same shape: application failures thrown by
/// a procedure and protocol failures (timeout, disconnect, bad path) are all
/// `RpcError`s and can be told apart by their [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RpcError {
    code: ErrorCode,
    message: String,
    path: Option<String>,
    cause: Option<String>,
    stack: Option<String>,
}

impl RpcError {
    /// create a new error of the given category
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            path: None,
            cause: None,
            stack: None,
        }
    }

    /// attach the procedure path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// attach a rendered cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The invocation did not finish within `after`.
    pub fn timeout(after: Duration, path: &str) -> Self {
        RpcError::new(
            ErrorCode::Timeout,
            format!("Request timed out after {}ms: {path}", after.as_millis()),
        )
        .with_path(path)
    }

    /// The port closed while the invocation was pending.
    pub fn disconnected(reason: impl fmt::Display) -> Self {
        RpcError::new(
            ErrorCode::Disconnected,
            format!("Port disconnected: {reason}"),
        )
    }

    /// The path names no procedure; `missing` is the first unresolved segment.
    pub fn not_found(path: &str, missing: &str) -> Self {
        RpcError::new(
            ErrorCode::NotFound,
            format!("No procedure found on path \"{path}\" (missing segment \"{missing}\")"),
        )
        .with_path(path)
    }

    /// The caller gave up on the invocation.
    pub fn cancelled(path: &str) -> Self {
        RpcError::new(
            ErrorCode::ClientClosedRequest,
            format!("Invocation cancelled: {path}"),
        )
        .with_path(path)
    }

    /// Shorthand for a `BAD_REQUEST` error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        RpcError::new(ErrorCode::BadRequest, message)
    }

    /// Shorthand for an `INTERNAL_SERVER_ERROR` error.
    pub fn internal(message: impl Into<String>) -> Self {
        RpcError::new(ErrorCode::InternalServerError, message)
    }

    /// Normalize an arbitrary error into a structured one.
    ///
    /// A boxed `RpcError` is taken over as is, any other error becomes an
    /// internal error that keeps its source chain as the cause.
    pub fn normalize(err: BoxError) -> Self {
        match err.downcast::<RpcError>() {
            Ok(rpc) => *rpc,
            Err(other) => {
                let message = other.to_string();
                let mut err = RpcError::internal(message.clone());
                let chain = source_chain(other.as_ref());
                err.cause = Some(chain.clone().unwrap_or(message));
                err.stack = Some(format!("{other:?}"));
                if let Some(chain) = chain {
                    err.stack = err.stack.map(|s| format!("{s}\ncaused by: {chain}"));
                }
                err
            }
        }
    }

    /// Normalize a caught panic payload, the last resort stringification.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "procedure panicked".to_owned()
        };
        RpcError::internal(message.clone()).with_cause(format!("panic: {message}"))
    }

    /// Serialize into the wire shape.
    ///
    /// `stack` and `cause` only leave the process when `dev` is set.
    pub fn to_shape(&self, dev: bool) -> ErrorShape {
        ErrorShape {
            code: self.code.json_rpc_code(),
            message: self.message.clone(),
            data: Some(ErrorData {
                code: self.code.as_str().to_owned(),
                http_status: Some(self.code.http_status()),
                path: self.path.clone(),
                stack: if dev { self.stack.clone() } else { None },
                cause: if dev { self.cause.clone() } else { None },
            }),
        }
    }

    /// Rebuild a structured error from the wire shape.
    pub fn from_shape(shape: ErrorShape) -> Self {
        let (code, path, cause, stack) = match shape.data {
            Some(data) => (
                ErrorCode::from_wire(&data.code),
                data.path,
                data.cause,
                data.stack,
            ),
            None => (ErrorCode::InternalServerError, None, None, None),
        };
        RpcError {
            code,
            message: shape.message,
            path,
            cause,
            stack,
        }
    }

    /// error category
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// human readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// procedure path, if known
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// rendered cause, only present on the server or in dev builds
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// diagnostic trace, only present on the server or in dev builds
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// true for `TIMEOUT`
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    /// true for `DISCONNECTED`
    pub fn is_disconnected(&self) -> bool {
        self.code == ErrorCode::Disconnected
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::new(ErrorCode::ParseError, err.to_string())
    }
}

fn source_chain(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(e) = source {
        causes.push(e.to_string());
        source = e.source();
    }
    if causes.is_empty() {
        None
    } else {
        Some(causes.join(": "))
    }
}
