use std::collections::HashMap;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::{Code, Request, Response, Status, Streaming};

use crate::pb;

/// Metadata key: each value, `"name: value"`, is sent back as a response header.
const METADATA_REPLY_HEADERS: &str = "reply-with-headers";

/// Metadata key: a non-zero status code to fail with before doing anything.
const METADATA_FAIL_EARLY: &str = "fail-early";

/// Instructions a client can embed in its request metadata.
struct Directives {
    reply_headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
    fail_early: Option<Code>,
}

impl Directives {
    fn from_metadata(md: &MetadataMap) -> Self {
        let reply_headers = md
            .get_all(METADATA_REPLY_HEADERS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| {
                let (name, value) = v.split_once(':')?;
                let key = name.trim().to_lowercase().parse().ok()?;
                let value = value.trim().parse().ok()?;
                Some((key, value))
            })
            .collect();

        let fail_early = md
            .get(METADATA_FAIL_EARLY)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok())
            .filter(|&code| code != 0)
            .map(Code::from_i32);

        Directives {
            reply_headers,
            fail_early,
        }
    }

    fn check(&self) -> Result<(), Status> {
        match self.fail_early {
            Some(code) => Err(Status::new(code, "fail")),
            None => Ok(()),
        }
    }

    fn respond<T>(&self, message: T) -> Response<T> {
        let mut response = Response::new(message);
        for (key, value) in &self.reply_headers {
            response.metadata_mut().append(key.clone(), value.clone());
        }
        response
    }
}

fn hello(name: &str, sequence_number: i32) -> pb::HelloReply {
    pb::HelloReply {
        message: format!("Hello, {name}!"),
        sequence_number,
    }
}

type ReplyStream = Pin<Box<dyn Stream<Item = Result<pb::HelloReply, Status>> + Send>>;

pub struct GreeterImpl;

#[tonic::async_trait]
impl pb::greeter_server::Greeter for GreeterImpl {
    async fn say_hello(
        &self,
        request: Request<pb::HelloRequest>,
    ) -> Result<Response<pb::HelloReply>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        let req = request.into_inner();
        Ok(directives.respond(hello(&req.name, 1)))
    }

    type StreamHellosStream = ReplyStream;

    async fn stream_hellos(
        &self,
        request: Request<pb::HelloRequest>,
    ) -> Result<Response<Self::StreamHellosStream>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        let req = request.into_inner();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for sequence_number in 1..=req.repeat_count.max(1) {
                if tx.send(Ok(hello(&req.name, sequence_number))).await.is_err() {
                    return;
                }
            }
        });

        Ok(directives.respond(Box::pin(ReceiverStream::new(rx)) as Self::StreamHellosStream))
    }

    async fn collect_hellos(
        &self,
        request: Request<Streaming<pb::HelloRequest>>,
    ) -> Result<Response<pb::HelloReply>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        let mut stream = request.into_inner();

        let mut names = Vec::new();
        while let Some(req) = stream.next().await {
            names.push(req?.name);
        }

        let count = i32::try_from(names.len()).unwrap_or(i32::MAX);
        Ok(directives.respond(hello(&names.join(", "), count)))
    }

    type ChatStream = ReplyStream;

    async fn chat(
        &self,
        request: Request<Streaming<pb::HelloRequest>>,
    ) -> Result<Response<Self::ChatStream>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        let mut in_stream = request.into_inner();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut sequence_number = 0;
            while let Some(result) = in_stream.next().await {
                let reply = result.map(|req| {
                    sequence_number += 1;
                    hello(&req.name, sequence_number)
                });
                let failed = reply.is_err();
                if tx.send(reply).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(directives.respond(Box::pin(ReceiverStream::new(rx)) as Self::ChatStream))
    }

    async fn fail(
        &self,
        request: Request<pb::FailRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        Err(Status::new(Code::from_i32(req.code), req.message))
    }

    async fn ping(&self, request: Request<pb::Empty>) -> Result<Response<pb::Empty>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        Ok(directives.respond(pb::Empty {}))
    }
}

pub struct AdminImpl;

#[tonic::async_trait]
impl pb::admin_server::Admin for AdminImpl {
    async fn ping(&self, request: Request<pb::Empty>) -> Result<Response<pb::Empty>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        Ok(directives.respond(pb::Empty {}))
    }

    async fn version(
        &self,
        request: Request<pb::Empty>,
    ) -> Result<Response<pb::VersionReply>, Status> {
        let directives = Directives::from_metadata(request.metadata());
        directives.check()?;
        Ok(directives.respond(pb::VersionReply {
            build_version: "1.0.0-test".to_string(),
            uptime_seconds: 42,
            build_labels: HashMap::from([("channel".to_string(), "stable".to_string())]),
        }))
    }
}
