//! gRPC server used by the grpcmd integration tests.
//!
//! Serves `testing.Greeter` and `testing.Admin` on a plaintext TCP listener,
//! optionally with the reflection service. Not meant for anything else.

mod service;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use service::{AdminImpl, GreeterImpl};

pub mod pb {
    tonic::include_proto!("testing");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("testing_descriptor");
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which reflection protocol versions the server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reflection {
    Disabled,
    /// Only the older `grpc.reflection.v1alpha` service.
    V1AlphaOnly,
    Enabled,
}

/// Serve on `listener` until the task is dropped or the transport fails.
pub async fn serve(listener: TcpListener, reflection: Reflection) -> Result<(), BoxError> {
    let v1 = match reflection {
        Reflection::Enabled => Some(
            ReflectionBuilder::configure()
                .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
                .build_v1()?,
        ),
        _ => None,
    };
    let v1alpha = match reflection {
        Reflection::Disabled => None,
        _ => Some(
            ReflectionBuilder::configure()
                .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
                .build_v1alpha()?,
        ),
    };

    Server::builder()
        .add_service(pb::greeter_server::GreeterServer::new(GreeterImpl))
        .add_service(pb::admin_server::AdminServer::new(AdminImpl))
        .add_optional_service(v1)
        .add_optional_service(v1alpha)
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;
    Ok(())
}

/// Start a server on an ephemeral localhost port in the current runtime and
/// return its address.
pub async fn spawn(reflection: Reflection) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = serve(listener, reflection).await {
            eprintln!("testserver on {addr} stopped: {e}");
        }
    });
    Ok(addr)
}
