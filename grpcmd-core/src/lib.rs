//! Dynamic gRPC invocation: call any method of any server without generated
//! stubs, using schema from `.proto` files or from server reflection.
//!
//! [`GrpcmdService`] is the entry point for callers that want plain values
//! back. [`InvocationContext`] exposes the same steps individually.

pub mod codec;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod descriptor_text;
pub mod error;
pub mod format;
pub mod invoke;
pub mod metadata;
pub mod methods;
pub mod reflection;
pub mod service;
pub mod snake_case;

pub use connection::ConnectionConfig;
pub use context::InvocationContext;
pub use descriptor::{DescriptorSource, FileSource, SymbolDescriptor};
pub use error::{DescriptorError, FormatError, GrpcmdError, Result, RpcError};
pub use format::FormatOptions;
pub use invoke::{InvocationEventHandler, InvocationResult};
pub use reflection::ServerSource;
pub use service::GrpcmdService;
