use std::collections::BTreeMap;
use std::io::Write;

use http::uri::PathAndQuery;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::client::Grpc;
use tonic::codec::CompressionEncoding;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use crate::codec::DynamicCodec;
use crate::descriptor::DescriptorSource;
use crate::error::{GrpcmdError, Result};
use crate::format::{FormatOptions, Formatter, JsonRequestParser};
use crate::metadata::{metadata_from_headers, metadata_to_map};
use crate::methods::resolve_method;

/// Request messages buffered between the sender task and the transport.
const REQUEST_BUFFER: usize = 16;

/// Observer of one invocation's progress, in protocol order: method
/// resolved, headers sent, headers received, each response, then trailers
/// together with the terminal status.
pub trait InvocationEventHandler: Send {
    fn on_resolve_method(&mut self, _method: &MethodDescriptor) {}

    fn on_send_headers(&mut self, _md: &MetadataMap) {}

    fn on_receive_headers(&mut self, _md: &MetadataMap) {}

    /// An error here ends the call with that error.
    fn on_receive_response(&mut self, _msg: &DynamicMessage) -> Result<()> {
        Ok(())
    }

    fn on_receive_trailers(&mut self, _status: &Status, _md: &MetadataMap) {}
}

/// Writes each response, formatted, to an output sink as it arrives.
pub struct ReportingHandler<'a> {
    formatter: Formatter,
    out: &'a mut (dyn Write + Send),
}

impl<'a> ReportingHandler<'a> {
    pub fn new(formatter: Formatter, out: &'a mut (dyn Write + Send)) -> Self {
        ReportingHandler { formatter, out }
    }
}

impl InvocationEventHandler for ReportingHandler<'_> {
    fn on_receive_response(&mut self, msg: &DynamicMessage) -> Result<()> {
        let text = (self.formatter)(msg)?;
        writeln!(self.out, "{text}")?;
        Ok(())
    }
}

/// Everything a completed call produced, ready for programmatic use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationResult {
    pub headers: BTreeMap<String, String>,
    /// Response messages as JSON text, in arrival order.
    pub messages: Vec<String>,
    pub trailers: BTreeMap<String, String>,
}

impl InvocationResult {
    /// A result carrying only a failure description.
    pub fn failure(message: impl Into<String>) -> Self {
        InvocationResult {
            messages: vec![message.into()],
            ..Default::default()
        }
    }
}

/// Accumulates headers, formatted responses and trailers.
pub struct CollectingHandler {
    formatter: Formatter,
    result: InvocationResult,
}

impl CollectingHandler {
    pub fn new(formatter: Formatter) -> Self {
        CollectingHandler {
            formatter,
            result: InvocationResult::default(),
        }
    }

    pub fn into_result(self) -> InvocationResult {
        self.result
    }
}

impl InvocationEventHandler for CollectingHandler {
    fn on_receive_headers(&mut self, md: &MetadataMap) {
        self.result.headers = metadata_to_map(md);
    }

    fn on_receive_response(&mut self, msg: &DynamicMessage) -> Result<()> {
        self.result.messages.push((self.formatter)(msg)?);
        Ok(())
    }

    fn on_receive_trailers(&mut self, _status: &Status, md: &MetadataMap) {
        self.result.trailers = metadata_to_map(md);
    }
}

/// What to call and with what.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    /// Fully-qualified method name, `pkg.Service.Method` or `pkg.Service/Method`.
    pub method: &'a str,
    /// `"Name: Value"` header strings.
    pub headers: &'a [String],
    /// Zero or more concatenated JSON request messages.
    pub data: &'a str,
    pub format: FormatOptions,
}

/// Invoke one RPC of any shape over `channel`.
///
/// Returns the terminal status, OK or not; `Err` is reserved for failures
/// on this side (resolution, request parsing, transport, sink writes).
/// Methods without client streaming take at most one request message, and
/// an empty body sends the default message. Streaming requests are parsed
/// and sent by a separate task while responses are being received.
pub async fn invoke_rpc(
    channel: Channel,
    source: &dyn DescriptorSource,
    request: InvocationRequest<'_>,
    max_message_size: Option<usize>,
    handler: &mut dyn InvocationEventHandler,
) -> Result<Status> {
    let method = resolve_method(source, request.method).await?;
    tracing::debug!(method = method.full_name(), "resolved method");
    handler.on_resolve_method(&method);

    let path = method_path(&method)?;
    let input = method.input();
    let mut parser = JsonRequestParser::new(request.data, request.format);

    // Requests for single-message methods are validated before anything is sent.
    let single = if method.is_client_streaming() {
        None
    } else {
        Some(single_request(&mut parser, &input, method.full_name())?)
    };

    let md = metadata_from_headers(request.headers);
    tracing::debug!(count = md.len(), "sending request headers");
    handler.on_send_headers(&md);

    let mut client = Grpc::new(channel).accept_compressed(CompressionEncoding::Gzip);
    if let Some(limit) = max_message_size {
        client = client
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
    }
    client
        .ready()
        .await
        .map_err(|e| GrpcmdError::Transport(format!("channel not ready: {e}")))?;
    let codec = DynamicCodec::for_method(&method);

    if let Some(message) = single {
        let request = with_metadata(tokio_stream::once(message), md);
        return exchange(&mut client, request, path, codec, handler).await;
    }

    let (tx, rx) = mpsc::channel::<DynamicMessage>(REQUEST_BUFFER);
    let (failure_tx, mut failure_rx) = oneshot::channel::<GrpcmdError>();
    let _sender = AbortOnDrop(tokio::spawn(async move {
        loop {
            match parser.next(&input) {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = failure_tx.send(e);
                    break;
                }
            }
        }
        tracing::debug!(sent = parser.num_requests(), "request stream closed");
    }));

    let request = with_metadata(ReceiverStream::new(rx), md);
    let call = exchange(&mut client, request, path, codec, handler);
    tokio::pin!(call);

    let mut sender_running = true;
    let status = loop {
        tokio::select! {
            biased;
            failure = &mut failure_rx, if sender_running => match failure {
                Ok(err) => return Err(err),
                Err(_) => sender_running = false,
            },
            result = &mut call => break result?,
        }
    };
    // A parse failure ends the request stream, which may let the call finish first.
    if sender_running {
        if let Ok(err) = failure_rx.try_recv() {
            return Err(err);
        }
    }
    Ok(status)
}

fn method_path(method: &MethodDescriptor) -> Result<PathAndQuery> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    PathAndQuery::try_from(path)
        .map_err(|e| GrpcmdError::Validation(format!("invalid method path: {e}")))
}

fn single_request(
    parser: &mut JsonRequestParser,
    input: &MessageDescriptor,
    method_name: &str,
) -> Result<DynamicMessage> {
    let first = parser.next(input)?;
    if parser.next(input)?.is_some() {
        return Err(GrpcmdError::Validation(format!(
            "method {method_name:?} is not client streaming, but request data contained more than 1 message"
        )));
    }
    Ok(first.unwrap_or_else(|| DynamicMessage::new(input.clone())))
}

fn with_metadata<S>(stream: S, md: MetadataMap) -> Request<S> {
    let mut request = Request::new(stream);
    *request.metadata_mut() = md;
    request
}

/// Send the request stream and drive the response through headers,
/// messages and trailers.
async fn exchange<S>(
    client: &mut Grpc<Channel>,
    request: Request<S>,
    path: PathAndQuery,
    codec: DynamicCodec,
    handler: &mut dyn InvocationEventHandler,
) -> Result<Status>
where
    S: Stream<Item = DynamicMessage> + Send + 'static,
{
    let response = match client.streaming(request, path, codec).await {
        Ok(response) => response,
        Err(status) => {
            // Trailers-only response: no headers, the metadata rides on the status.
            tracing::debug!(code = ?status.code(), "call failed before any response");
            handler.on_receive_headers(&MetadataMap::new());
            handler.on_receive_trailers(&status, status.metadata());
            return Ok(status);
        }
    };

    handler.on_receive_headers(response.metadata());
    let mut stream = response.into_inner();
    let mut received = 0usize;
    loop {
        match stream.message().await {
            Ok(Some(message)) => {
                received += 1;
                handler.on_receive_response(&message)?;
            }
            Ok(None) => break,
            Err(status) => {
                tracing::debug!(received, code = ?status.code(), "call failed mid-stream");
                handler.on_receive_trailers(&status, status.metadata());
                return Ok(status);
            }
        }
    }

    let trailers = match stream.trailers().await {
        Ok(trailers) => trailers.unwrap_or_default(),
        Err(status) => {
            handler.on_receive_trailers(&status, status.metadata());
            return Ok(status);
        }
    };
    tracing::debug!(received, "call completed");
    let status = Status::new(Code::Ok, "");
    handler.on_receive_trailers(&status, &trailers);
    Ok(status)
}

/// Stops the sender task if the call ends before the request stream does.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::{DescriptorPool, Value};
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

    fn note_descriptor() -> MessageDescriptor {
        let file = FileDescriptorProto {
            name: Some("note.proto".into()),
            package: Some("notes".into()),
            syntax: Some("proto3".into()),
            message_type: vec![DescriptorProto {
                name: Some("Note".into()),
                field: vec![FieldDescriptorProto {
                    name: Some("text".into()),
                    json_name: Some("text".into()),
                    number: Some(1),
                    r#type: Some(Type::String as i32),
                    label: Some(Label::Optional as i32),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool.get_message_by_name("notes.Note").unwrap()
    }

    #[test]
    fn empty_body_sends_default_message() {
        let desc = note_descriptor();
        let mut parser = JsonRequestParser::new("  ", FormatOptions::strict());
        let msg = single_request(&mut parser, &desc, "notes.Svc.Put").unwrap();
        assert_eq!(msg, DynamicMessage::new(desc));
    }

    #[test]
    fn single_message_is_parsed() {
        let desc = note_descriptor();
        let mut parser = JsonRequestParser::new(r#"{"text": "hi"}"#, FormatOptions::strict());
        let msg = single_request(&mut parser, &desc, "notes.Svc.Put").unwrap();
        assert_eq!(
            msg.get_field_by_name("text").unwrap().as_ref(),
            &Value::String("hi".into())
        );
    }

    #[test]
    fn second_message_is_rejected() {
        let desc = note_descriptor();
        let mut parser =
            JsonRequestParser::new(r#"{"text": "a"} {"text": "b"}"#, FormatOptions::strict());
        let err = single_request(&mut parser, &desc, "notes.Svc.Put").unwrap_err();
        assert!(matches!(err, GrpcmdError::Validation(_)));
        assert!(err.to_string().contains("more than 1 message"));
    }

    #[test]
    fn collecting_handler_flattens_metadata() {
        let desc = note_descriptor();
        let mut handler = CollectingHandler::new(crate::format::json_formatter(
            &FormatOptions::lenient(),
        ));

        let mut headers = MetadataMap::new();
        headers.insert("x-region", "eu".parse().unwrap());
        let mut trailers = MetadataMap::new();
        trailers.insert("x-cost", "3".parse().unwrap());

        handler.on_receive_headers(&headers);
        handler
            .on_receive_response(&DynamicMessage::new(desc))
            .unwrap();
        handler.on_receive_trailers(&Status::new(Code::Ok, ""), &trailers);

        let result = handler.into_result();
        assert_eq!(result.headers.get("x-region").map(String::as_str), Some("eu"));
        assert_eq!(result.trailers.get("x-cost").map(String::as_str), Some("3"));
        assert_eq!(result.messages, vec!["{\n  \"text\": \"\"\n}".to_string()]);
    }

    #[test]
    fn reporting_handler_writes_each_response() {
        let desc = note_descriptor();
        let mut out: Vec<u8> = Vec::new();
        {
            let mut handler = ReportingHandler::new(
                crate::format::json_formatter(&FormatOptions::strict()),
                &mut out,
            );
            let mut msg = DynamicMessage::new(desc);
            msg.set_field_by_name("text", Value::String("one".into()));
            handler.on_receive_response(&msg).unwrap();
            handler.on_receive_response(&msg).unwrap();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\n  \"text\": \"one\"\n}\n{\n  \"text\": \"one\"\n}\n"
        );
    }

    #[test]
    fn failure_result_has_one_message() {
        let result = InvocationResult::failure("boom");
        assert_eq!(result.messages, vec!["boom"]);
        assert!(result.headers.is_empty());
        assert!(result.trailers.is_empty());
    }
}
