use std::collections::HashMap;
use std::sync::LazyLock;

use prost_reflect::{
    DeserializeOptions, DescriptorPool, DynamicMessage, Kind, MapKey, MessageDescriptor,
    ReflectMessage, SerializeOptions, Value,
};

use crate::error::{FormatError, GrpcmdError, Result};

/// Options controlling request parsing and response formatting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Include fields with default values in JSON output.
    pub emit_defaults: bool,

    /// Accept unknown fields in JSON input without error.
    pub allow_unknown_fields: bool,
}

impl FormatOptions {
    /// Unknown request fields are rejected. Used by plain calls.
    pub fn strict() -> Self {
        FormatOptions {
            emit_defaults: true,
            allow_unknown_fields: false,
        }
    }

    /// Unknown request fields are ignored. Used when collecting results.
    pub fn lenient() -> Self {
        FormatOptions {
            emit_defaults: true,
            allow_unknown_fields: true,
        }
    }
}

/// Reads request messages one at a time from a block of concatenated JSON
/// objects. Whitespace between objects is ignored.
#[derive(Debug)]
pub struct JsonRequestParser {
    data: String,
    offset: usize,
    num_requests: usize,
    options: FormatOptions,
}

impl JsonRequestParser {
    pub fn new(data: impl Into<String>, options: FormatOptions) -> Self {
        JsonRequestParser {
            data: data.into(),
            offset: 0,
            num_requests: 0,
            options,
        }
    }

    /// Parse the next message, or `None` once the input is exhausted.
    pub fn next(&mut self, desc: &MessageDescriptor) -> Result<Option<DynamicMessage>> {
        let remaining = &self.data[self.offset..];
        let trimmed = remaining.trim_start();
        if trimmed.is_empty() {
            return Ok(None);
        }
        self.offset += remaining.len() - trimmed.len();

        let mut values = serde_json::Deserializer::from_str(trimmed).into_iter::<serde_json::Value>();
        let value = match values.next() {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                return Err(FormatError::InvalidJson {
                    message_type: desc.full_name().to_string(),
                    detail: e.to_string(),
                }
                .into())
            }
            None => return Ok(None),
        };
        self.offset += values.byte_offset();
        self.num_requests += 1;

        decode_json_value(desc, value, self.options.allow_unknown_fields).map(Some)
    }

    /// Number of messages parsed so far.
    pub fn num_requests(&self) -> usize {
        self.num_requests
    }
}

fn decode_json_value(
    desc: &MessageDescriptor,
    value: serde_json::Value,
    allow_unknown_fields: bool,
) -> Result<DynamicMessage> {
    let options = DeserializeOptions::new().deny_unknown_fields(!allow_unknown_fields);
    match DynamicMessage::deserialize_with_options(desc.clone(), value.clone(), &options) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            // A strict failure that a lenient parse accepts can only be an unknown field.
            let lenient = DeserializeOptions::new().deny_unknown_fields(false);
            let unknown_field = !allow_unknown_fields
                && DynamicMessage::deserialize_with_options(desc.clone(), value, &lenient).is_ok();
            let message_type = desc.full_name().to_string();
            let detail = err.to_string();
            Err(if unknown_field {
                FormatError::UnknownField { message_type, detail }
            } else {
                FormatError::InvalidJson { message_type, detail }
            }
            .into())
        }
    }
}

/// Build a message with every field populated so that its JSON form shows
/// callers the shape of a valid request.
///
/// Repeated fields get one element, maps get one entry, nested messages are
/// filled in recursively. A message type already being built higher up the
/// current path is left empty.
pub fn make_template(desc: &MessageDescriptor) -> DynamicMessage {
    TemplateBuilder::default().build(desc)
}

#[derive(Default)]
struct TemplateBuilder {
    path: Vec<String>,
}

impl TemplateBuilder {
    fn build(&mut self, desc: &MessageDescriptor) -> DynamicMessage {
        if let Some(sample) = well_known_sample(desc) {
            return sample;
        }
        let mut msg = DynamicMessage::new(desc.clone());
        if self.path.iter().any(|name| name == desc.full_name()) {
            return msg;
        }

        self.path.push(desc.full_name().to_string());
        for field in desc.fields() {
            if let Some(value) = self.field_value(&field) {
                msg.set_field(&field, value);
            }
        }
        self.path.pop();
        msg
    }

    fn field_value(&mut self, field: &prost_reflect::FieldDescriptor) -> Option<Value> {
        let kind = field.kind();
        if field.is_map() {
            let entry = kind.as_message()?;
            let key = default_map_key(&entry.map_entry_key_field().kind())?;
            let value = self.element(&entry.map_entry_value_field().kind());
            Some(Value::Map(HashMap::from([(key, value)])))
        } else if field.is_list() {
            Some(Value::List(vec![self.element(&kind)]))
        } else {
            // Singular scalars stay unset; emitting defaults shows them.
            kind.as_message().map(|sub| Value::Message(self.build(sub)))
        }
    }

    fn element(&mut self, kind: &Kind) -> Value {
        match kind {
            Kind::Message(desc) => Value::Message(self.build(desc)),
            other => Value::default_value(other),
        }
    }
}

fn default_map_key(kind: &Kind) -> Option<MapKey> {
    Some(match kind {
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => MapKey::I32(0),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => MapKey::I64(0),
        Kind::Uint32 | Kind::Fixed32 => MapKey::U32(0),
        Kind::Uint64 | Kind::Fixed64 => MapKey::U64(0),
        Kind::Bool => MapKey::Bool(false),
        Kind::String => MapKey::String(String::new()),
        _ => return None,
    })
}

const ARBITRARY_JSON_HINT: &str = "google.protobuf.Value supports arbitrary JSON";

/// Samples for well-known types whose JSON form is not a plain object.
fn well_known_sample(desc: &MessageDescriptor) -> Option<DynamicMessage> {
    let mut msg = DynamicMessage::new(desc.clone());
    match desc.full_name() {
        "google.protobuf.Any" => {
            // The JSON form of Any needs the named type in the same pool.
            if desc
                .parent_pool()
                .get_message_by_name("google.protobuf.Empty")
                .is_some()
            {
                msg.set_field_by_name(
                    "type_url",
                    Value::String("type.googleapis.com/google.protobuf.Empty".into()),
                );
            }
        }
        "google.protobuf.Value" => {
            msg.set_field_by_name("string_value", Value::String(ARBITRARY_JSON_HINT.into()));
        }
        "google.protobuf.ListValue" => {
            let values = desc.get_field_by_name("values")?;
            let element = well_known_sample(values.kind().as_message()?)?;
            msg.set_field(&values, Value::List(vec![Value::Message(element)]));
        }
        "google.protobuf.Struct" => {
            let fields = desc.get_field_by_name("fields")?;
            let entry = fields.kind().as_message()?.clone();
            let value_kind = entry.map_entry_value_field().kind();
            let value_desc = value_kind.as_message()?;
            let mut value = DynamicMessage::new(value_desc.clone());
            value.set_field_by_name(
                "string_value",
                Value::String("google.protobuf.Struct supports arbitrary JSON objects".into()),
            );
            let entries = HashMap::from([(MapKey::String("key".into()), Value::Message(value))]);
            msg.set_field(&fields, Value::Map(entries));
        }
        _ => return None,
    }
    Some(msg)
}

/// Renders one response message as text.
pub type Formatter = Box<dyn Fn(&DynamicMessage) -> Result<String> + Send + Sync>;

/// Pretty-printed JSON (2-space indent) in the protobuf JSON mapping.
pub fn json_formatter(options: &FormatOptions) -> Formatter {
    let serialize_options = SerializeOptions::new()
        .skip_default_fields(!options.emit_defaults)
        .stringify_64_bit_integers(true);

    Box::new(move |msg: &DynamicMessage| {
        let encode_error =
            |e: serde_json::Error| FormatError::Encode(format!("{}: {e}", msg.descriptor().full_name()));
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::new(&mut buf);
        msg.serialize_with_options(&mut serializer, &serialize_options)
            .map_err(encode_error)?;
        let mut value: serde_json::Value = serde_json::from_slice(&buf).map_err(encode_error)?;
        normalize_json_floats(&mut value);
        serde_json::to_string_pretty(&value).map_err(|e| encode_error(e).into())
    })
}

/// Print whole-valued floats as integers, without the trailing ".0"
/// serde_json adds. Strings are left alone.
fn normalize_json_floats(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Number(number) => {
            let whole = number
                .as_f64()
                .filter(|f| number.is_f64() && f.is_finite() && f.fract() == 0.0)
                .filter(|f| *f >= i64::MIN as f64 && *f < i64::MAX as f64);
            if let Some(f) = whole {
                *number = serde_json::Number::from(f as i64);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(normalize_json_floats),
        serde_json::Value::Object(fields) => fields.values_mut().for_each(normalize_json_floats),
        _ => {}
    }
}

/// Canonical name of a gRPC status code.
pub fn status_code_name(code: tonic::Code) -> &'static str {
    match code {
        tonic::Code::Ok => "OK",
        tonic::Code::Cancelled => "Canceled",
        tonic::Code::Unknown => "Unknown",
        tonic::Code::InvalidArgument => "InvalidArgument",
        tonic::Code::DeadlineExceeded => "DeadlineExceeded",
        tonic::Code::NotFound => "NotFound",
        tonic::Code::AlreadyExists => "AlreadyExists",
        tonic::Code::PermissionDenied => "PermissionDenied",
        tonic::Code::ResourceExhausted => "ResourceExhausted",
        tonic::Code::FailedPrecondition => "FailedPrecondition",
        tonic::Code::Aborted => "Aborted",
        tonic::Code::OutOfRange => "OutOfRange",
        tonic::Code::Unimplemented => "Unimplemented",
        tonic::Code::Internal => "Internal",
        tonic::Code::Unavailable => "Unavailable",
        tonic::Code::DataLoss => "DataLoss",
        tonic::Code::Unauthenticated => "Unauthenticated",
    }
}

const RPC_STATUS: &str = "google.rpc.Status";

/// Descriptor for `google.rpc.Status`, registered next to the well-known types
/// so that `details` can refer to `google.protobuf.Any`.
static RPC_STATUS_DESCRIPTOR: LazyLock<Option<MessageDescriptor>> = LazyLock::new(|| {
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

    let field = |name: &str, number: i32, label: Label, ty: Type, type_name: Option<&str>| {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            type_name: type_name.map(Into::into),
            json_name: Some(name.into()),
            ..Default::default()
        }
    };

    let file = FileDescriptorProto {
        name: Some("google/rpc/status.proto".into()),
        package: Some("google.rpc".into()),
        dependency: vec!["google/protobuf/any.proto".into()],
        message_type: vec![DescriptorProto {
            name: Some("Status".into()),
            field: vec![
                field("code", 1, Label::Optional, Type::Int32, None),
                field("message", 2, Label::Optional, Type::String, None),
                field(
                    "details",
                    3,
                    Label::Repeated,
                    Type::Message,
                    Some(".google.protobuf.Any"),
                ),
            ],
            ..Default::default()
        }],
        syntax: Some("proto3".into()),
        ..Default::default()
    };

    let mut pool = DescriptorPool::global();
    if pool.get_message_by_name(RPC_STATUS).is_none() {
        if let Err(e) = pool.add_file_descriptor_proto(file) {
            tracing::warn!("cannot register {RPC_STATUS}: {e}");
            return None;
        }
    }
    pool.get_message_by_name(RPC_STATUS)
});

/// Render a terminal status as a `google.rpc.Status` message through the
/// given formatter, the same way response messages are rendered.
///
/// Details sent by the server are included when their types can be resolved;
/// otherwise they are dropped and only code and message are shown.
pub fn format_status(status: &tonic::Status, formatter: &Formatter) -> Result<String> {
    let desc = RPC_STATUS_DESCRIPTOR
        .clone()
        .ok_or_else(|| GrpcmdError::from(FormatError::Encode(format!("{RPC_STATUS} is unavailable"))))?;

    let mut msg = DynamicMessage::decode(desc.clone(), status.details())
        .unwrap_or_else(|_| DynamicMessage::new(desc));
    msg.set_field_by_name("code", Value::I32(status.code() as i32));
    msg.set_field_by_name("message", Value::String(status.message().to_string()));

    match formatter(&msg) {
        Ok(text) => Ok(text),
        Err(e) if msg.has_field_by_name("details") => {
            tracing::debug!("dropping unresolvable status details: {e}");
            msg.clear_field_by_name("details");
            formatter(&msg)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pool() -> DescriptorPool {
        use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

        let scalar = |name: &str, number: i32, ty: i32, label: i32, json: &str| FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            r#type: Some(ty),
            label: Some(label),
            json_name: Some(json.into()),
            ..Default::default()
        };

        let tags = scalar("tags", 3, 9, 3, "tags");
        let mut child = scalar("child", 4, 11, 1, "child");
        child.type_name = Some(".test.Node".into());
        let mut attributes = scalar("attributes", 5, 11, 3, "attributes");
        attributes.type_name = Some(".test.Node.AttributesEntry".into());

        let fds = prost_types::FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("test.proto".into()),
                package: Some("test".into()),
                message_type: vec![DescriptorProto {
                    name: Some("Node".into()),
                    field: vec![
                        scalar("display_name", 1, 9, 1, "displayName"),
                        scalar("weight", 2, 1, 1, "weight"),
                        tags,
                        child,
                        attributes,
                    ],
                    nested_type: vec![DescriptorProto {
                        name: Some("AttributesEntry".into()),
                        field: vec![
                            scalar("key", 1, 9, 1, "key"),
                            scalar("value", 2, 3, 1, "value"),
                        ],
                        options: Some(prost_types::MessageOptions {
                            map_entry: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        DescriptorPool::from_file_descriptor_set(fds).unwrap()
    }

    fn node(pool: &DescriptorPool) -> MessageDescriptor {
        pool.get_message_by_name("test.Node").unwrap()
    }

    #[test]
    fn parse_concatenated_messages() {
        let pool = make_pool();
        let desc = node(&pool);
        let mut parser = JsonRequestParser::new(
            r#"{"displayName": "a"}  {"displayName": "b"}"#,
            FormatOptions::strict(),
        );

        let first = parser.next(&desc).unwrap().unwrap();
        let second = parser.next(&desc).unwrap().unwrap();
        assert!(parser.next(&desc).unwrap().is_none());
        assert_eq!(parser.num_requests(), 2);
        assert_eq!(
            first.get_field_by_name("display_name").unwrap().as_str(),
            Some("a")
        );
        assert_eq!(
            second.get_field_by_name("display_name").unwrap().as_str(),
            Some("b")
        );
    }

    #[test]
    fn parse_blank_input_yields_nothing() {
        let pool = make_pool();
        let mut parser = JsonRequestParser::new("  \n\t ", FormatOptions::strict());
        assert!(parser.next(&node(&pool)).unwrap().is_none());
        assert_eq!(parser.num_requests(), 0);
    }

    #[test]
    fn strict_mode_rejects_unknown_field() {
        let pool = make_pool();
        let mut parser =
            JsonRequestParser::new(r#"{"displayName": "a", "bogus": 1}"#, FormatOptions::strict());
        let err = parser.next(&node(&pool)).unwrap_err();
        assert!(
            matches!(err, GrpcmdError::Format(FormatError::UnknownField { .. })),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn lenient_mode_ignores_unknown_field() {
        let pool = make_pool();
        let mut parser =
            JsonRequestParser::new(r#"{"displayName": "a", "bogus": 1}"#, FormatOptions::lenient());
        let msg = parser.next(&node(&pool)).unwrap().unwrap();
        assert_eq!(msg.get_field_by_name("display_name").unwrap().as_str(), Some("a"));
    }

    #[test]
    fn malformed_json_is_invalid_json() {
        let pool = make_pool();
        let mut parser = JsonRequestParser::new(r#"{"displayName": "#, FormatOptions::strict());
        let err = parser.next(&node(&pool)).unwrap_err();
        assert!(matches!(err, GrpcmdError::Format(FormatError::InvalidJson { .. })));
    }

    #[test]
    fn wrong_value_type_is_invalid_json_in_strict_mode() {
        let pool = make_pool();
        let mut parser = JsonRequestParser::new(r#"{"weight": "heavy"}"#, FormatOptions::strict());
        let err = parser.next(&node(&pool)).unwrap_err();
        assert!(matches!(err, GrpcmdError::Format(FormatError::InvalidJson { .. })));
    }

    #[test]
    fn formatter_emits_defaults() {
        let pool = make_pool();
        let msg = DynamicMessage::new(node(&pool));
        let json = json_formatter(&FormatOptions::strict())(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["displayName"], "");
        assert_eq!(value["weight"], 0);
        assert_eq!(value["tags"], serde_json::json!([]));
    }

    #[test]
    fn formatter_without_defaults_is_empty_object() {
        let pool = make_pool();
        let msg = DynamicMessage::new(node(&pool));
        let formatter = json_formatter(&FormatOptions::default());
        assert_eq!(formatter(&msg).unwrap(), "{}");
    }

    #[test]
    fn whole_floats_lose_trailing_zero() {
        let mut value = serde_json::json!({
            "weight": 42.0,
            "w": -3.0,
            "x": 1.5,
            "samples": [2.0, 2.5, {"depth": 7.0}],
            "count": 3,
            "note": "ratio: 2.0 ok",
        });
        normalize_json_floats(&mut value);
        assert_eq!(
            value,
            serde_json::json!({
                "weight": 42,
                "w": -3,
                "x": 1.5,
                "samples": [2, 2.5, {"depth": 7}],
                "count": 3,
                "note": "ratio: 2.0 ok",
            })
        );
        assert_eq!(serde_json::to_string(&value["samples"]).unwrap(), "[2,2.5,{\"depth\":7}]");
    }

    #[test]
    fn formatter_keeps_string_payloads_and_field_order() {
        let pool = make_pool();
        let mut msg = DynamicMessage::new(node(&pool));
        msg.set_field_by_name("display_name", Value::String("ratio: 2.0 ok".into()));
        msg.set_field_by_name("weight", Value::F64(42.0));

        let formatter = json_formatter(&FormatOptions::default());
        assert_eq!(
            formatter(&msg).unwrap(),
            "{\n  \"displayName\": \"ratio: 2.0 ok\",\n  \"weight\": 42\n}"
        );
    }

    #[test]
    fn template_fills_lists_maps_and_children() {
        let pool = make_pool();
        let template = make_template(&node(&pool));
        let json = json_formatter(&FormatOptions::strict())(&template).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["tags"], serde_json::json!([""]));
        // int64 values use the string form of the JSON mapping.
        assert_eq!(value["attributes"], serde_json::json!({"": "0"}));
        // Node contains Node: the nested copy stops the recursion.
        assert!(value["child"].is_object());
        assert_eq!(value["child"]["tags"], serde_json::json!([]));
    }

    #[test]
    fn template_round_trips_through_json_and_wire() {
        use prost::Message;

        let pool = make_pool();
        let desc = node(&pool);
        let formatter = json_formatter(&FormatOptions::strict());
        let template = make_template(&desc);
        let json = formatter(&template).unwrap();

        let mut parser = JsonRequestParser::new(json.clone(), FormatOptions::strict());
        let parsed = parser.next(&desc).unwrap().unwrap();
        let decoded = DynamicMessage::decode(desc, parsed.encode_to_vec().as_slice()).unwrap();

        let before: serde_json::Value = serde_json::from_str(&json).unwrap();
        let after: serde_json::Value = serde_json::from_str(&formatter(&decoded).unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn status_is_formatted_with_code_and_message() {
        let formatter = json_formatter(&FormatOptions::strict());
        let status = tonic::Status::not_found("no such user");
        let text = format_status(&status, &formatter).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["code"], 5);
        assert_eq!(value["message"], "no such user");
        assert_eq!(value["details"], serde_json::json!([]));
    }

    #[test]
    fn status_code_names() {
        assert_eq!(status_code_name(tonic::Code::Ok), "OK");
        assert_eq!(status_code_name(tonic::Code::Cancelled), "Canceled");
        assert_eq!(status_code_name(tonic::Code::NotFound), "NotFound");
    }
}
