use std::io::Write;
use std::sync::Arc;

use tonic::transport::Channel;
use tonic::Code;

use crate::connection::{create_channel, ConnectionConfig};
use crate::descriptor::{descriptor_source_from_proto_files, DescriptorSource, SymbolDescriptor};
use crate::descriptor_text::descriptor_text;
use crate::error::{GrpcmdError, Result, RpcError};
use crate::format::{format_status, json_formatter, make_template, FormatOptions};
use crate::invoke::{
    invoke_rpc, CollectingHandler, InvocationRequest, InvocationResult, ReportingHandler,
};
use crate::methods::{self, methods_by_service, resolve_method};
use crate::reflection::ServerSource;
use crate::snake_case::format_messages_to_snake_case;

type Cleanup = Box<dyn FnOnce() + Send>;
type Sink = Box<dyn Write + Send>;

/// State for one logical call: at most one descriptor source, at most one
/// connection, and the cleanup actions that release them.
///
/// Cleanup runs in reverse registration order on [`close`](Self::close),
/// or on drop if `close` was never called.
pub struct InvocationContext {
    config: ConnectionConfig,
    source: Option<Arc<dyn DescriptorSource>>,
    channel: Option<Channel>,
    cleanup: Vec<Cleanup>,
    services: Option<Vec<String>>,
    methods: Option<Vec<(String, Vec<String>)>>,
    out: Sink,
    err: Sink,
}

impl Default for InvocationContext {
    fn default() -> Self {
        InvocationContext::with_config(ConnectionConfig::default())
    }
}

impl InvocationContext {
    pub fn new() -> Self {
        InvocationContext::default()
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        InvocationContext {
            config,
            source: None,
            channel: None,
            cleanup: Vec::new(),
            services: None,
            methods: None,
            out: Box::new(std::io::stdout()),
            err: Box::new(std::io::stderr()),
        }
    }

    /// Where plain calls write their responses. Defaults to stdout.
    pub fn with_output(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    /// Where failed statuses are reported. Defaults to stderr.
    pub fn with_error_output(mut self, err: impl Write + Send + 'static) -> Self {
        self.err = Box::new(err);
        self
    }

    /// Load schema from `.proto` files instead of server reflection.
    /// Without files this is a no-op and reflection is used on connect.
    pub fn load_proto_files(&mut self, import_paths: &[String], proto_files: &[String]) -> Result<()> {
        if proto_files.is_empty() {
            return Ok(());
        }
        let source = descriptor_source_from_proto_files(import_paths, proto_files)?;
        self.set_descriptor_source(Arc::new(source));
        Ok(())
    }

    pub fn set_descriptor_source(&mut self, source: Arc<dyn DescriptorSource>) {
        self.source = Some(source);
        self.services = None;
        self.methods = None;
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the channel to `address`. Without a descriptor source, one
    /// backed by the server's reflection service is created as well.
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        if self.is_connected() {
            return Err(GrpcmdError::Validation(format!(
                "already connected, cannot connect to {address}"
            )));
        }

        let channel = create_channel(&self.config, address).await?;
        tracing::debug!(address, "connected");
        let handle = channel.clone();
        let closing = address.to_string();
        self.cleanup.push(Box::new(move || {
            tracing::debug!(address = %closing, "closing connection");
            drop(handle);
        }));

        if self.source.is_none() {
            let reflection = Arc::new(
                ServerSource::new(channel.clone())
                    .with_max_message_size(self.config.max_message_size),
            );
            let handle = Arc::clone(&reflection);
            self.cleanup.push(Box::new(move || handle.reset()));
            self.source = Some(reflection);
        }

        self.channel = Some(channel);
        Ok(())
    }

    fn require_source(&self) -> Result<Arc<dyn DescriptorSource>> {
        self.source.clone().ok_or_else(|| {
            GrpcmdError::Validation("no descriptor source: connect or load proto files first".into())
        })
    }

    fn require_channel(&self) -> Result<Channel> {
        self.channel
            .clone()
            .ok_or_else(|| GrpcmdError::Validation("not connected".into()))
    }

    /// Sorted service names, fetched once per context.
    pub async fn services(&mut self) -> Result<Vec<String>> {
        if let Some(services) = &self.services {
            return Ok(services.clone());
        }
        let services = self.require_source()?.list_services().await?;
        self.services = Some(services.clone());
        Ok(services)
    }

    async fn grouped_methods(&mut self) -> Result<Vec<(String, Vec<String>)>> {
        if let Some(grouped) = &self.methods {
            return Ok(grouped.clone());
        }
        let source = self.require_source()?;
        let grouped = methods_by_service(source.as_ref()).await?;
        self.services = Some(grouped.iter().map(|(service, _)| service.clone()).collect());
        self.methods = Some(grouped.clone());
        Ok(grouped)
    }

    /// Every fully-qualified method, service by service.
    pub async fn methods(&mut self) -> Result<Vec<String>> {
        Ok(self
            .grouped_methods()
            .await?
            .into_iter()
            .flat_map(|(_, methods)| methods)
            .collect())
    }

    pub async fn services_methods_output(&mut self) -> Result<String> {
        Ok(methods::services_methods_output(&self.grouped_methods().await?))
    }

    pub async fn nonambiguous_methods(&mut self) -> Result<Vec<String>> {
        Ok(methods::nonambiguous_methods(&self.methods().await?))
    }

    /// Proto text of the method and both of its message types, followed by
    /// a JSON template for the request.
    pub async fn describe_method(&mut self, method: &str) -> Result<String> {
        let source = self.require_source()?;
        let method = resolve_method(source.as_ref(), method).await?;
        let input = method.input();
        let template = json_formatter(&FormatOptions::strict())(&make_template(&input))?;

        Ok(format!(
            "{}\n\n{}\n\n{}\n\n{} Template:\n{}",
            descriptor_text(&SymbolDescriptor::Method(method.clone())),
            descriptor_text(&SymbolDescriptor::Message(input.clone())),
            descriptor_text(&SymbolDescriptor::Message(method.output())),
            input.name(),
            template,
        ))
    }

    /// Invoke `method`, writing each response to the output sink.
    ///
    /// Unknown request fields are rejected. A non-OK status is written to
    /// the error sink and returned as `GrpcmdError::Rpc`.
    pub async fn call(&mut self, method: &str, data: &str, headers: &[String]) -> Result<()> {
        let options = FormatOptions::strict();
        let channel = self.require_channel()?;
        let source = self.require_source()?;
        let request = InvocationRequest {
            method,
            headers,
            data,
            format: options,
        };

        let mut handler = ReportingHandler::new(json_formatter(&options), self.out.as_mut());
        let status = invoke_rpc(
            channel,
            source.as_ref(),
            request,
            self.config.max_message_size,
            &mut handler,
        )
        .await?;
        self.out.flush()?;
        self.check_status(&status, &options)
    }

    /// Invoke `method` and collect its headers, responses and trailers.
    ///
    /// Unknown request fields are ignored and responses come back with
    /// snake_case keys. Nothing is returned from a call that did not end OK.
    pub async fn call_with_result(
        &mut self,
        method: &str,
        data: &str,
        headers: &[String],
    ) -> Result<InvocationResult> {
        let options = FormatOptions::lenient();
        let channel = self.require_channel()?;
        let source = self.require_source()?;
        let request = InvocationRequest {
            method,
            headers,
            data,
            format: options,
        };

        let mut handler = CollectingHandler::new(json_formatter(&options));
        let status = invoke_rpc(
            channel,
            source.as_ref(),
            request,
            self.config.max_message_size,
            &mut handler,
        )
        .await?;
        self.check_status(&status, &options)?;

        let mut result = handler.into_result();
        result.messages = format_messages_to_snake_case(&result.messages)?;
        Ok(result)
    }

    /// Report a non-OK status on the error sink, once, then fail with it.
    fn check_status(&mut self, status: &tonic::Status, options: &FormatOptions) -> Result<()> {
        if status.code() == Code::Ok {
            return Ok(());
        }
        let text = format_status(status, &json_formatter(options))?;
        write!(self.err, "\n{text}\n")?;
        self.err.flush()?;
        Err(RpcError::from(status).into())
    }

    /// Release everything this context acquired, newest first.
    pub fn close(&mut self) {
        self.channel = None;
        self.source = None;
        self.services = None;
        self.methods = None;
        while let Some(release) = self.cleanup.pop() {
            release();
        }
    }
}

impl Drop for InvocationContext {
    fn drop(&mut self) {
        self.close();
    }
}
