use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{GrpcmdError, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings applied when a context opens its channel.
///
/// The library never reads flags or environment variables itself; callers
/// build one of these and hand it to the context or service.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for the channel to become ready.
    pub connect_timeout: Duration,

    /// Prepended to the default `grpcmd/<version>` user agent.
    pub user_agent: Option<String>,

    /// Maximum size, in bytes, of a single request or response message.
    /// `None` keeps tonic's limit.
    pub max_message_size: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: None,
            max_message_size: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = Some(limit);
        self
    }
}

/// Open a plaintext HTTP/2 channel to `address` (`host:port` or a full
/// `http://` URI), waiting at most `connect_timeout` for it to be ready.
pub async fn create_channel(config: &ConnectionConfig, address: &str) -> Result<Channel> {
    let uri = endpoint_uri(address);
    let connection_error = |message: String| GrpcmdError::Connection {
        address: address.to_string(),
        message,
    };

    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| connection_error(format!("invalid address: {e}")))?
        .connect_timeout(config.connect_timeout)
        .user_agent(build_user_agent(config))
        .map_err(|e| connection_error(format!("invalid user agent: {e}")))?;

    tracing::debug!(address, "connecting");
    match tokio::time::timeout(config.connect_timeout, endpoint.connect()).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(connection_error(transport_error_chain(&e))),
        Err(_) => Err(connection_error(format!(
            "timed out after {:?}",
            config.connect_timeout
        ))),
    }
}

fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// tonic's transport error hides the useful part in its source chain.
fn transport_error_chain(err: &tonic::transport::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// `grpcmd/<version>`, prefixed with the configured user agent if any.
pub fn build_user_agent(config: &ConnectionConfig) -> String {
    let base = format!("grpcmd/{}", env!("CARGO_PKG_VERSION"));
    match &config.user_agent {
        Some(custom) => format!("{custom} {base}"),
        None => base,
    }
}
