use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use tonic::transport::Channel;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};
use tonic_reflection::pb::v1alpha;
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient as V1AlphaClient;

use crate::descriptor::{self, DescriptorSource, SymbolDescriptor};
use crate::error::{DescriptorError, GrpcmdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReflectionVersion {
    V1,
    V1Alpha,
}

#[derive(Debug)]
struct ReflectionState {
    pool: DescriptorPool,
    services: Option<Vec<String>>,
}

impl ReflectionState {
    fn empty() -> Self {
        ReflectionState {
            pool: DescriptorPool::new(),
            services: None,
        }
    }
}

/// Descriptor source backed by the server reflection service.
///
/// Nothing is fetched until the first query. The service list and every
/// file descriptor received are cached until [`reset`](Self::reset), so a
/// context never asks the server the same question twice.
///
/// The protocol version is negotiated on the first request: `v1` is tried,
/// and `v1alpha` is used when the server does not implement it.
pub struct ServerSource {
    channel: Channel,
    max_message_size: Option<usize>,
    version: OnceLock<ReflectionVersion>,
    state: Mutex<ReflectionState>,
}

impl ServerSource {
    pub fn new(channel: Channel) -> Self {
        ServerSource {
            channel,
            max_message_size: None,
            version: OnceLock::new(),
            state: Mutex::new(ReflectionState::empty()),
        }
    }

    /// Limit the size of reflection responses, like any other response.
    pub fn with_max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Drop everything learned from the server.
    pub fn reset(&self) {
        tracing::debug!("resetting reflection client");
        *self.state() = ReflectionState::empty();
    }

    fn state(&self) -> MutexGuard<'_, ReflectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn reflect(&self, request: MessageRequest) -> Result<MessageResponse> {
        match self.version.get() {
            Some(ReflectionVersion::V1) => return self.reflect_v1(request).await,
            Some(ReflectionVersion::V1Alpha) => return self.reflect_v1alpha(request).await,
            None => {}
        }

        match self.reflect_v1(request.clone()).await {
            Ok(response) => {
                let _ = self.version.set(ReflectionVersion::V1);
                Ok(response)
            }
            Err(GrpcmdError::Descriptor(DescriptorError::ReflectionUnsupported)) => {
                tracing::debug!("server has no v1 reflection service, trying v1alpha");
                let response = self.reflect_v1alpha(request).await?;
                let _ = self.version.set(ReflectionVersion::V1Alpha);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn reflect_v1(&self, request: MessageRequest) -> Result<MessageResponse> {
        let mut client = V1Client::new(self.channel.clone());
        if let Some(limit) = self.max_message_size {
            client = client.max_decoding_message_size(limit);
        }
        let outbound = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };

        let mut inbound = client
            .server_reflection_info(tokio_stream::once(outbound))
            .await
            .map_err(status_error)?
            .into_inner();
        let response = inbound
            .message()
            .await
            .map_err(status_error)?
            .ok_or_else(empty_stream_error)?;
        message_response(response)
    }

    /// v1alpha messages are wire-compatible with v1, so requests and
    /// responses are converted by re-encoding them.
    async fn reflect_v1alpha(&self, request: MessageRequest) -> Result<MessageResponse> {
        let mut client = V1AlphaClient::new(self.channel.clone());
        if let Some(limit) = self.max_message_size {
            client = client.max_decoding_message_size(limit);
        }
        let outbound: v1alpha::ServerReflectionRequest = transcode(&ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        })?;

        let mut inbound = client
            .server_reflection_info(tokio_stream::once(outbound))
            .await
            .map_err(status_error)?
            .into_inner();
        let response = inbound
            .message()
            .await
            .map_err(status_error)?
            .ok_or_else(empty_stream_error)?;
        message_response(transcode(&response)?)
    }

    /// Add the files of one reflection response to the pool, first fetching
    /// any dependency the pool does not have yet.
    async fn add_files(&self, encoded: &[Vec<u8>]) -> Result<()> {
        let mut pending = Vec::with_capacity(encoded.len());
        for bytes in encoded {
            let file = FileDescriptorProto::decode(bytes.as_slice())
                .map_err(|e| DescriptorError::Parse(format!("file descriptor from server: {e}")))?;
            pending.push(file);
        }

        let missing: Vec<String> = {
            let state = self.state();
            pending.retain(|file| state.pool.get_file_by_name(file.name()).is_none());
            let included: HashSet<&str> = pending.iter().map(|f| f.name()).collect();
            pending
                .iter()
                .flat_map(|file| file.dependency.iter())
                .filter(|dep| !included.contains(dep.as_str()))
                .filter(|dep| state.pool.get_file_by_name(dep).is_none())
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        for dependency in descriptor::remove_duplicates(&missing) {
            match self
                .reflect(MessageRequest::FileByFilename(dependency.clone()))
                .await
            {
                Ok(MessageResponse::FileDescriptorResponse(response)) => {
                    Box::pin(self.add_files(&response.file_descriptor_proto)).await?;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%dependency, "cannot fetch dependency: {e}"),
            }
        }

        let mut state = self.state();
        pending.retain(|file| state.pool.get_file_by_name(file.name()).is_none());
        if pending.is_empty() {
            return Ok(());
        }
        let set = FileDescriptorSet {
            file: pending.clone(),
        };
        if state.pool.add_file_descriptor_set(set).is_err() {
            // Keep whatever can be added on its own.
            for file in pending {
                let name = file.name().to_string();
                let single = FileDescriptorSet { file: vec![file] };
                if let Err(e) = state.pool.add_file_descriptor_set(single) {
                    tracing::warn!(file = %name, "skipping file descriptor: {e}");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DescriptorSource for ServerSource {
    async fn list_services(&self) -> Result<Vec<String>> {
        let cached = self.state().services.clone();
        if let Some(services) = cached {
            return Ok(services);
        }

        let response = self
            .reflect(MessageRequest::ListServices("*".to_string()))
            .await?;
        let MessageResponse::ListServicesResponse(list) = response else {
            return Err(unexpected_response("list services"));
        };
        let mut services: Vec<String> = list.service.into_iter().map(|s| s.name).collect();
        services.sort();

        self.state().services = Some(services.clone());
        Ok(services)
    }

    async fn find_symbol(&self, fully_qualified_name: &str) -> Result<SymbolDescriptor> {
        let cached = descriptor::find_symbol_in_pool(&self.state().pool, fully_qualified_name);
        if let Ok(symbol) = cached {
            return Ok(symbol);
        }

        let request = MessageRequest::FileContainingSymbol(fully_qualified_name.to_string());
        match self.reflect(request).await {
            Ok(MessageResponse::FileDescriptorResponse(response)) => {
                self.add_files(&response.file_descriptor_proto).await?;
            }
            Ok(_) => return Err(unexpected_response("file containing symbol")),
            Err(GrpcmdError::Descriptor(DescriptorError::Reflection { code, .. }))
                if code == tonic::Code::NotFound as i32 =>
            {
                return Err(DescriptorError::NotFound(fully_qualified_name.to_string()).into());
            }
            Err(e) => return Err(e),
        }

        let found = descriptor::find_symbol_in_pool(&self.state().pool, fully_qualified_name);
        found
    }
}

fn status_error(status: tonic::Status) -> GrpcmdError {
    if status.code() == tonic::Code::Unimplemented {
        DescriptorError::ReflectionUnsupported.into()
    } else {
        DescriptorError::Reflection {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
        .into()
    }
}

fn empty_stream_error() -> GrpcmdError {
    DescriptorError::Reflection {
        code: tonic::Code::Internal as i32,
        message: "reflection stream closed without a response".into(),
    }
    .into()
}

fn unexpected_response(request: &str) -> GrpcmdError {
    DescriptorError::Reflection {
        code: tonic::Code::Internal as i32,
        message: format!("unexpected response to {request} request"),
    }
    .into()
}

/// Unwrap a reflection response, turning an error response into an error.
fn message_response(response: ServerReflectionResponse) -> Result<MessageResponse> {
    match response.message_response {
        Some(MessageResponse::ErrorResponse(err)) => Err(DescriptorError::Reflection {
            code: err.error_code,
            message: err.error_message,
        }
        .into()),
        Some(message) => Ok(message),
        None => Err(DescriptorError::Reflection {
            code: tonic::Code::Internal as i32,
            message: "reflection response has no message".into(),
        }
        .into()),
    }
}

fn transcode<T: Message + Default>(message: &impl Message) -> Result<T> {
    T::decode(message.encode_to_vec().as_slice())
        .map_err(|e| DescriptorError::Parse(format!("reflection message: {e}")).into())
}
