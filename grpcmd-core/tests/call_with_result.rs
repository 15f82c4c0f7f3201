mod common;

use common::{service, start_server, testserver_proto, Reflection};
use grpcmd_core::InvocationResult;

fn hello(message: &str, sequence_number: i32) -> String {
    format!("{{\n  \"message\": \"{message}\",\n  \"sequence_number\": {sequence_number}\n}}")
}

#[tokio::test]
async fn unary_call() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{}", r#"{"name": "ada"}"#, &[], &[])
        .await;

    assert_eq!(result.messages, vec![hello("Hello, ada!", 1)]);
    assert_eq!(
        result.headers.get("content-type").map(String::as_str),
        Some("application/grpc")
    );
    assert!(!result.trailers.contains_key("grpc-status"));
}

#[tokio::test]
async fn slash_separated_method_name() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter/SayHello", "", r#"{"name": "ada"}"#, &[], &[])
        .await;
    assert_eq!(result.messages, vec![hello("Hello, ada!", 1)]);
}

#[tokio::test]
async fn empty_body_sends_default_request() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{}", "", &[], &[])
        .await;
    assert_eq!(result.messages, vec![hello("Hello, !", 1)]);
}

#[tokio::test]
async fn server_streaming_call() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.StreamHellos",
            "{}",
            r#"{"name": "bo", "repeatCount": 3}"#,
            &[],
            &[],
        )
        .await;

    assert_eq!(
        result.messages,
        vec![
            hello("Hello, bo!", 1),
            hello("Hello, bo!", 2),
            hello("Hello, bo!", 3),
        ]
    );
}

#[tokio::test]
async fn client_streaming_call() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.CollectHellos",
            "{}",
            "{\"name\": \"a\"}\n{\"name\": \"b\"}\n{\"name\": \"c\"}",
            &[],
            &[],
        )
        .await;
    assert_eq!(result.messages, vec![hello("Hello, a, b, c!", 3)]);
}

#[tokio::test]
async fn bidi_streaming_call() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.Chat",
            "{}",
            r#"{"name": "x"} {"name": "y"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(
        result.messages,
        vec![hello("Hello, x!", 1), hello("Hello, y!", 2)]
    );
}

#[tokio::test]
async fn metadata_headers_are_sent() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.SayHello",
            r#"{"reply-with-headers": "x-echo: hi"}"#,
            r#"{"name": "ada"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(result.headers.get("x-echo").map(String::as_str), Some("hi"));
}

#[tokio::test]
async fn request_transcript_headers_are_sent() {
    let addr = start_server(Reflection::Enabled).await;
    let request = "Reply-With-Headers: x-from-request: yes\n\n{\"name\": \"ada\"}";
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{}", request, &[], &[])
        .await;
    assert_eq!(
        result.headers.get("x-from-request").map(String::as_str),
        Some("yes")
    );
    assert_eq!(result.messages, vec![hello("Hello, ada!", 1)]);
}

#[tokio::test]
async fn unknown_fields_are_ignored() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.SayHello",
            "{}",
            r#"{"name": "ada", "nickname": "countess"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(result.messages, vec![hello("Hello, ada!", 1)]);
}

#[tokio::test]
async fn int64_and_map_fields_in_results() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Admin.Version", "{}", "{}", &[], &[])
        .await;
    assert_eq!(
        result.messages,
        vec![
            "{\n  \"build_labels\": {\n    \"channel\": \"stable\"\n  },\n  \"build_version\": \"1.0.0-test\",\n  \"uptime_seconds\": \"42\"\n}"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn non_ok_status_becomes_the_only_message() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.Fail",
            "{}",
            r#"{"code": 5, "message": "gone"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(
        result,
        InvocationResult::failure("rpc error: code = NotFound desc = gone")
    );
}

#[tokio::test]
async fn fail_early_directive_from_metadata() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.Chat",
            r#"{"fail-early": 7}"#,
            r#"{"name": "x"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(
        result,
        InvocationResult::failure("rpc error: code = PermissionDenied desc = fail")
    );
}

#[tokio::test]
async fn non_ascii_metadata_is_rejected() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.SayHello",
            "{\"authorization\": \"Bearer \u{2603}\"}",
            "{}",
            &[],
            &[],
        )
        .await;
    assert_eq!(
        result.messages,
        vec!["Metadata contains non-ASCII characters.".to_string()]
    );
}

#[tokio::test]
async fn malformed_metadata_json_is_a_message_not_a_crash() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{\"a\": [", "{}", &[], &[])
        .await;
    assert_eq!(result.messages.len(), 1);
    assert!(result.messages[0].starts_with("metadata is not a JSON object"));
}

#[tokio::test]
async fn unknown_method() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter.Nope", "{}", "{}", &[], &[])
        .await;
    assert_eq!(
        result,
        InvocationResult::failure("Symbol not found: testing.Greeter.Nope")
    );
}

#[tokio::test]
async fn several_messages_for_a_unary_method() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.SayHello",
            "{}",
            r#"{"name": "a"} {"name": "b"}"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(result.messages.len(), 1);
    assert!(result.messages[0].contains("more than 1 message"));
}

#[tokio::test]
async fn malformed_streaming_request_discards_the_call() {
    let addr = start_server(Reflection::Enabled).await;
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.CollectHellos",
            "{}",
            r#"{"name": "a"} {"name": }"#,
            &[],
            &[],
        )
        .await;
    assert_eq!(result.messages.len(), 1);
    assert!(result.messages[0].starts_with("invalid JSON for testing.HelloRequest"));
    assert!(result.headers.is_empty());
}

#[tokio::test]
async fn schema_from_proto_files_without_reflection() {
    let addr = start_server(Reflection::Disabled).await;
    let proto = testserver_proto();
    let result = service()
        .call_with_result(
            &addr,
            "testing.Greeter.SayHello",
            "{}",
            r#"{"name": "files"}"#,
            &[],
            &[proto.clone(), proto],
        )
        .await;
    assert_eq!(result.messages, vec![hello("Hello, files!", 1)]);
}

#[tokio::test]
async fn missing_reflection_without_proto_files() {
    let addr = start_server(Reflection::Disabled).await;
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{}", "{}", &[], &[])
        .await;
    assert_eq!(
        result,
        InvocationResult::failure("server does not support the reflection API")
    );
}

#[tokio::test]
async fn connection_refused() {
    let addr = common::closed_address();
    let result = service()
        .call_with_result(&addr, "testing.Greeter.SayHello", "{}", "{}", &[], &[])
        .await;
    assert_eq!(result.messages.len(), 1);
    assert!(result.messages[0].starts_with(&format!("failed to connect to {addr}")));
}
