use crate::format::status_code_name;

/// Offset added to a gRPC status code to form the caller-visible exit code.
/// Codes 0-63 stay reserved for failures that never reached the server.
pub const STATUS_CODE_OFFSET: i32 = 64;

/// All error types produced by the grpcmd engine.
#[derive(Debug, thiserror::Error)]
pub enum GrpcmdError {
    /// Caller input rejected before any network I/O (metadata, headers).
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The connection could not be established within the deadline.
    #[error("failed to connect to {address}: {message}")]
    Connection { address: String, message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Format(#[from] FormatError),

    /// Writing to an output or error sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel failed after it was established.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures resolving schema metadata.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Symbol not found: {0}")]
    NotFound(String),

    #[error("failed to parse proto files: {0}")]
    Parse(String),

    #[error("server does not support the reflection API")]
    ReflectionUnsupported,

    /// The symbol exists but is some other kind of descriptor.
    #[error("{name} is not a method (found {kind})")]
    NotAMethod { name: String, kind: &'static str },

    /// The reflection service answered with an error response.
    #[error("reflection request failed (code {code}): {message}")]
    Reflection { code: i32, message: String },
}

/// Failures converting between JSON text and protobuf messages.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Strict mode saw a field the message type does not declare.
    #[error("message type {message_type} has no such field: {detail}")]
    UnknownField { message_type: String, detail: String },

    #[error("invalid JSON for {message_type}: {detail}")]
    InvalidJson { message_type: String, detail: String },

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A call that completed with a non-OK terminal status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rpc error: code = {} desc = {message}", status_code_name(*.code))]
pub struct RpcError {
    pub code: tonic::Code,
    pub message: String,
}

impl RpcError {
    pub fn exit_code(&self) -> i32 {
        STATUS_CODE_OFFSET + self.code as i32
    }
}

impl From<&tonic::Status> for RpcError {
    fn from(status: &tonic::Status) -> Self {
        RpcError {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl GrpcmdError {
    /// Process exit code for this failure: `64 + status` for RPC errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            GrpcmdError::Rpc(err) => err.exit_code(),
            _ => 1,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GrpcmdError::Descriptor(DescriptorError::NotFound(_))
                | GrpcmdError::Descriptor(DescriptorError::NotAMethod { .. })
        )
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GrpcmdError>;
