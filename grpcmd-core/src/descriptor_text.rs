use prost_reflect::{
    Cardinality, EnumDescriptor, EnumValueDescriptor, FieldDescriptor, Kind, MessageDescriptor,
    MethodDescriptor, OneofDescriptor, ServiceDescriptor,
};

use crate::descriptor::SymbolDescriptor;

/// Render a descriptor as `.proto` source text.
///
/// Type references are fully qualified with a leading dot, service methods
/// are sorted by name and message members by field number. Nested enums and
/// messages follow the fields; synthesized map entry types are left out.
pub fn descriptor_text(symbol: &SymbolDescriptor) -> String {
    let mut writer = ProtoWriter::default();
    match symbol {
        SymbolDescriptor::Service(d) => writer.service(d),
        SymbolDescriptor::Method(d) => writer.method(d),
        SymbolDescriptor::Message(d) => writer.message(d),
        SymbolDescriptor::Enum(d) => writer.enumeration(d),
        SymbolDescriptor::Field(d) => writer.field(d),
        SymbolDescriptor::EnumValue(d) => writer.enum_value(d),
    }
    writer.finish()
}

#[derive(Default)]
struct ProtoWriter {
    out: String,
    depth: usize,
}

enum Member {
    Field(FieldDescriptor),
    Oneof(OneofDescriptor),
}

impl ProtoWriter {
    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn open(&mut self, header: &str) {
        self.line(&format!("{header} {{"));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    fn finish(mut self) -> String {
        let len = self.out.trim_end_matches('\n').len();
        self.out.truncate(len);
        self.out
    }

    fn service(&mut self, service: &ServiceDescriptor) {
        self.open(&format!("service {}", service.name()));
        let mut methods: Vec<_> = service.methods().collect();
        methods.sort_by(|a, b| a.name().cmp(b.name()));
        for method in &methods {
            self.method(method);
        }
        self.close();
    }

    fn method(&mut self, method: &MethodDescriptor) {
        let stream = |on: bool| if on { "stream " } else { "" };
        self.line(&format!(
            "rpc {} ( {}.{} ) returns ( {}.{} );",
            method.name(),
            stream(method.is_client_streaming()),
            method.input().full_name(),
            stream(method.is_server_streaming()),
            method.output().full_name(),
        ));
    }

    fn message(&mut self, message: &MessageDescriptor) {
        self.open(&format!("message {}", message.name()));

        for reserved in reserved_lines(message) {
            self.line(&reserved);
        }

        let mut members: Vec<(u32, Member)> = Vec::new();
        for field in message.fields() {
            if declared_oneof(&field).is_none() {
                members.push((field.number(), Member::Field(field)));
            }
        }
        for oneof in message.oneofs() {
            let mut numbers = oneof
                .fields()
                .filter(|f| declared_oneof(f).is_some())
                .map(|f| f.number())
                .peekable();
            if numbers.peek().is_none() {
                continue;
            }
            let first = numbers.min().unwrap_or(u32::MAX);
            members.push((first, Member::Oneof(oneof)));
        }
        members.sort_by_key(|(number, _)| *number);

        for (_, member) in &members {
            match member {
                Member::Field(field) => self.field(field),
                Member::Oneof(oneof) => self.oneof(oneof),
            }
        }

        for nested in message.child_enums() {
            self.enumeration(&nested);
        }
        for nested in message.child_messages().filter(|m| !m.is_map_entry()) {
            self.message(&nested);
        }

        self.close();
    }

    fn oneof(&mut self, oneof: &OneofDescriptor) {
        self.open(&format!("oneof {}", oneof.name()));
        let mut fields: Vec<_> = oneof.fields().collect();
        fields.sort_by_key(|f| f.number());
        for field in &fields {
            self.field(field);
        }
        self.close();
    }

    fn field(&mut self, field: &FieldDescriptor) {
        let deprecated = field
            .field_descriptor_proto()
            .options
            .as_ref()
            .and_then(|o| o.deprecated)
            .unwrap_or(false);
        self.line(&format!(
            "{}{} {} = {}{};",
            field_label(field),
            field_type(field),
            field.name(),
            field.number(),
            if deprecated { " [deprecated = true]" } else { "" },
        ));
    }

    fn enumeration(&mut self, enumeration: &EnumDescriptor) {
        self.open(&format!("enum {}", enumeration.name()));
        let mut values: Vec<_> = enumeration.values().collect();
        values.sort_by_key(|v| v.number());
        for value in &values {
            self.enum_value(value);
        }
        self.close();
    }

    fn enum_value(&mut self, value: &EnumValueDescriptor) {
        self.line(&format!("{} = {};", value.name(), value.number()));
    }
}

/// The oneof a field was declared in, ignoring the ones synthesized for
/// proto3 `optional`.
fn declared_oneof(field: &FieldDescriptor) -> Option<OneofDescriptor> {
    if is_proto3_optional(field) {
        return None;
    }
    field.containing_oneof()
}

fn is_proto3_optional(field: &FieldDescriptor) -> bool {
    field
        .field_descriptor_proto()
        .proto3_optional
        .unwrap_or(false)
}

fn field_label(field: &FieldDescriptor) -> &'static str {
    if field.is_map() {
        return "";
    }
    if field.is_list() {
        return "repeated ";
    }
    if is_proto3_optional(field) {
        return "optional ";
    }
    let proto3 = field.parent_file().file_descriptor_proto().syntax.as_deref() == Some("proto3");
    if proto3 || field.containing_oneof().is_some() {
        return "";
    }
    match field.cardinality() {
        Cardinality::Required => "required ",
        _ => "optional ",
    }
}

fn field_type(field: &FieldDescriptor) -> String {
    if field.is_map() {
        if let Kind::Message(entry) = field.kind() {
            return format!(
                "map<{}, {}>",
                type_name(&entry.map_entry_key_field().kind()),
                type_name(&entry.map_entry_value_field().kind()),
            );
        }
    }
    type_name(&field.kind())
}

fn type_name(kind: &Kind) -> String {
    let name = match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int64 => "int64",
        Kind::Uint64 => "uint64",
        Kind::Int32 => "int32",
        Kind::Fixed64 => "fixed64",
        Kind::Fixed32 => "fixed32",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Uint32 => "uint32",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Message(m) => return format!(".{}", m.full_name()),
        Kind::Enum(e) => return format!(".{}", e.full_name()),
    };
    name.to_string()
}

fn reserved_lines(message: &MessageDescriptor) -> Vec<String> {
    let proto = message.descriptor_proto();
    let mut lines = Vec::new();

    if !proto.reserved_range.is_empty() {
        let ranges: Vec<String> = proto
            .reserved_range
            .iter()
            .map(|r| {
                let start = r.start.unwrap_or(0);
                // end is exclusive on the wire
                let end = r.end.unwrap_or(start + 1) - 1;
                match end {
                    _ if end == start => start.to_string(),
                    _ if end >= 536_870_911 => format!("{start} to max"),
                    _ => format!("{start} to {end}"),
                }
            })
            .collect();
        lines.push(format!("reserved {};", ranges.join(", ")));
    }
    if !proto.reserved_name.is_empty() {
        let names: Vec<String> = proto
            .reserved_name
            .iter()
            .map(|n| format!("\"{n}\""))
            .collect();
        lines.push(format!("reserved {};", names.join(", ")));
    }
    lines
}
