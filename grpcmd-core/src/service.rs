use std::path::Path;

use crate::connection::ConnectionConfig;
use crate::context::InvocationContext;
use crate::descriptor::remove_duplicates;
use crate::error::Result;
use crate::invoke::InvocationResult;
use crate::metadata::{ensure_printable_ascii, parse_metadata, split_headers_and_body};
use crate::snake_case::format_message_to_snake_case;

/// Returned by [`GrpcmdService::method_template`] when the method
/// description carries no request template.
pub const TEMPLATE_NOT_FOUND: &str = "Unable to find method template.";

const TEMPLATE_MARKER: &str = "Template:\n";

/// Caller-facing operations. Each one builds a fresh
/// [`InvocationContext`], uses it for a single logical call and closes it.
///
/// Failures never escape as errors: they come back as the text of the
/// error, in the slot where the result would have been.
#[derive(Debug, Clone, Default)]
pub struct GrpcmdService {
    config: ConnectionConfig,
}

impl GrpcmdService {
    pub fn new() -> Self {
        GrpcmdService::default()
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        GrpcmdService { config }
    }

    fn context(&self) -> InvocationContext {
        InvocationContext::with_config(self.config.clone())
    }

    /// Invoke `method` on `address` and collect the outcome.
    ///
    /// `metadata` is a JSON object of header names to values (or a header
    /// line) and must be printable ASCII. `request` is either a JSON body or
    /// a header block, a blank line, then the body; its headers are sent
    /// along with the metadata. With `proto_files`, the schema comes from
    /// those files instead of server reflection.
    pub async fn call_with_result(
        &self,
        address: &str,
        method: &str,
        metadata: &str,
        request: &str,
        proto_paths: &[String],
        proto_files: &[String],
    ) -> InvocationResult {
        self.try_call_with_result(address, method, metadata, request, proto_paths, proto_files)
            .await
            .unwrap_or_else(|e| InvocationResult::failure(e.to_string()))
    }

    async fn try_call_with_result(
        &self,
        address: &str,
        method: &str,
        metadata: &str,
        request: &str,
        proto_paths: &[String],
        proto_files: &[String],
    ) -> Result<InvocationResult> {
        let mut headers = parse_metadata(metadata)?;
        let request = split_headers_and_body(request)?;
        for header in &request.headers {
            ensure_printable_ascii(header)?;
        }
        headers.extend(request.headers);

        let mut ctx = self.context();
        ctx.load_proto_files(&extended_proto_paths(proto_paths, proto_files), proto_files)?;
        ctx.connect(address).await?;
        let result = ctx.call_with_result(method, &request.body, &headers).await;
        ctx.close();
        result
    }

    /// Fully-qualified names of every method the server exposes.
    pub async fn nonambiguous_methods(&self, address: &str) -> Vec<String> {
        let mut ctx = self.context();
        let methods = match ctx.connect(address).await {
            Ok(()) => ctx.nonambiguous_methods().await,
            Err(e) => Err(e),
        };
        ctx.close();
        methods.unwrap_or_else(|e| vec![e.to_string()])
    }

    /// The request template of `method` as snake_case JSON.
    pub async fn method_template(&self, address: &str, method: &str) -> String {
        let description = match self.describe(address, method).await {
            Ok(description) => description,
            Err(e) => return e.to_string(),
        };
        let Some(start) = description.find(TEMPLATE_MARKER) else {
            return TEMPLATE_NOT_FOUND.to_string();
        };
        format_message_to_snake_case(&description[start + TEMPLATE_MARKER.len()..])
            .unwrap_or_default()
    }

    /// Services and their methods as an indented listing.
    pub async fn services_methods_output(&self, address: &str) -> String {
        let mut ctx = self.context();
        let output = match ctx.connect(address).await {
            Ok(()) => ctx.services_methods_output().await,
            Err(e) => Err(e),
        };
        ctx.close();
        output.unwrap_or_else(|e| e.to_string())
    }

    /// Proto text of `method` and its message types plus a request template.
    pub async fn describe_method(&self, address: &str, method: &str) -> String {
        self.describe(address, method)
            .await
            .unwrap_or_else(|e| e.to_string())
    }

    async fn describe(&self, address: &str, method: &str) -> Result<String> {
        let mut ctx = self.context();
        ctx.connect(address).await?;
        let description = ctx.describe_method(method).await;
        ctx.close();
        description
    }
}

/// Search paths plus the directory of every proto file, so each file's
/// siblings can be imported by bare name.
pub fn extended_proto_paths(proto_paths: &[String], proto_files: &[String]) -> Vec<String> {
    let mut paths = proto_paths.to_vec();
    for file in proto_files {
        if let Some(parent) = Path::new(file).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() {
                paths.push(parent.into_owned());
            }
        }
    }
    remove_duplicates(&paths)
}
