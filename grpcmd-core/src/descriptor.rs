use std::collections::HashSet;
use std::hash::Hash;

use async_trait::async_trait;
use prost_reflect::{
    DescriptorPool, EnumDescriptor, EnumValueDescriptor, FieldDescriptor, MessageDescriptor,
    MethodDescriptor, ServiceDescriptor,
};

use crate::error::{DescriptorError, Result};

/// Supplies schema metadata for dynamic invocation.
///
/// Two implementations exist: [`FileSource`], loaded from `.proto` files
/// before connecting, and [`ServerSource`](crate::reflection::ServerSource),
/// queried from the server's reflection service after connecting. A source
/// never changes the set of symbols it has already answered with.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Fully-qualified names of all services, sorted.
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Find a descriptor by its fully-qualified name.
    ///
    /// Returns `DescriptorError::NotFound` if the symbol does not exist.
    async fn find_symbol(&self, fully_qualified_name: &str) -> Result<SymbolDescriptor>;

    /// Fully-qualified names of the methods of `service`, sorted.
    async fn list_methods(&self, service: &str) -> Result<Vec<String>> {
        let symbol = self.find_symbol(service).await?;
        let SymbolDescriptor::Service(svc) = symbol else {
            return Err(DescriptorError::NotFound(format!("service {service}")).into());
        };
        let mut methods: Vec<String> = svc.methods().map(|m| m.full_name().to_string()).collect();
        methods.sort();
        Ok(methods)
    }
}

/// A resolved protobuf symbol.
#[derive(Debug, Clone)]
pub enum SymbolDescriptor {
    Service(ServiceDescriptor),
    Method(MethodDescriptor),
    Message(MessageDescriptor),
    Enum(EnumDescriptor),
    Field(FieldDescriptor),
    EnumValue(EnumValueDescriptor),
}

impl SymbolDescriptor {
    pub fn full_name(&self) -> &str {
        match self {
            SymbolDescriptor::Service(d) => d.full_name(),
            SymbolDescriptor::Method(d) => d.full_name(),
            SymbolDescriptor::Message(d) => d.full_name(),
            SymbolDescriptor::Enum(d) => d.full_name(),
            SymbolDescriptor::Field(d) => d.full_name(),
            SymbolDescriptor::EnumValue(d) => d.full_name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SymbolDescriptor::Service(_) => "service",
            SymbolDescriptor::Method(_) => "method",
            SymbolDescriptor::Message(_) => "message",
            SymbolDescriptor::Enum(_) => "enum",
            SymbolDescriptor::Field(_) => "field",
            SymbolDescriptor::EnumValue(_) => "enum value",
        }
    }

    /// The method descriptor, or `NotAMethod` naming what was found instead.
    pub fn into_method(self) -> Result<MethodDescriptor> {
        match self {
            SymbolDescriptor::Method(method) => Ok(method),
            other => Err(DescriptorError::NotAMethod {
                name: other.full_name().to_string(),
                kind: other.kind(),
            }
            .into()),
        }
    }
}

/// Descriptor source backed by compiled file descriptors.
#[derive(Debug, Clone)]
pub struct FileSource {
    pool: DescriptorPool,
}

impl FileSource {
    pub fn new(pool: DescriptorPool) -> Self {
        FileSource { pool }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

#[async_trait]
impl DescriptorSource for FileSource {
    async fn list_services(&self) -> Result<Vec<String>> {
        let mut services: Vec<String> = self
            .pool
            .services()
            .map(|s| s.full_name().to_string())
            .collect();
        services.sort();
        Ok(services)
    }

    async fn find_symbol(&self, fully_qualified_name: &str) -> Result<SymbolDescriptor> {
        find_symbol_in_pool(&self.pool, fully_qualified_name)
    }
}

/// Drop repeated entries, keeping the first occurrence of each.
pub fn remove_duplicates<T: Clone + Eq + Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(*item))
        .cloned()
        .collect()
}

/// Compile `.proto` files with `protox` and wrap the result as a source.
///
/// Both lists are deduplicated first, since callers are known to pass the
/// same file or path more than once. Without import paths the current
/// directory is searched.
pub fn descriptor_source_from_proto_files(
    import_paths: &[String],
    proto_files: &[String],
) -> Result<FileSource> {
    let import_paths = remove_duplicates(import_paths);
    let proto_files = remove_duplicates(proto_files);
    let includes: Vec<&str> = if import_paths.is_empty() {
        vec!["."]
    } else {
        import_paths.iter().map(String::as_str).collect()
    };

    tracing::debug!(files = ?proto_files, includes = ?includes, "compiling proto files");
    let fds = protox::compile(&proto_files, &includes)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;

    descriptor_source_from_file_descriptor_set(fds)
}

pub fn descriptor_source_from_file_descriptor_set(
    fds: prost_types::FileDescriptorSet,
) -> Result<FileSource> {
    let pool = DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;
    Ok(FileSource::new(pool))
}

/// Look up any symbol by fully-qualified name.
///
/// Top-level types are tried first; otherwise the name is split at its last
/// dot and the child is looked up in the parent (method in service, field in
/// message, value in enum). Enum values are scoped like their enum, so
/// `pkg.VALUE` is the canonical name; `pkg.Enum.VALUE` is accepted too.
pub(crate) fn find_symbol_in_pool(pool: &DescriptorPool, name: &str) -> Result<SymbolDescriptor> {
    if let Some(svc) = pool.get_service_by_name(name) {
        return Ok(SymbolDescriptor::Service(svc));
    }
    if let Some(msg) = pool.get_message_by_name(name) {
        return Ok(SymbolDescriptor::Message(msg));
    }
    if let Some(e) = pool.get_enum_by_name(name) {
        return Ok(SymbolDescriptor::Enum(e));
    }

    if let Some((parent, child)) = name.rsplit_once('.') {
        if let Some(svc) = pool.get_service_by_name(parent) {
            if let Some(method) = svc.methods().find(|m| m.name() == child) {
                return Ok(SymbolDescriptor::Method(method));
            }
        }
        if let Some(field) = pool
            .get_message_by_name(parent)
            .and_then(|msg| msg.get_field_by_name(child))
        {
            return Ok(SymbolDescriptor::Field(field));
        }
        let scoped_value = pool.all_enums().find_map(|e| {
            let scope = e.full_name().rsplit_once('.').map_or("", |(scope, _)| scope);
            if scope == parent {
                e.get_value_by_name(child)
            } else {
                None
            }
        });
        if let Some(value) = scoped_value.or_else(|| {
            pool.get_enum_by_name(parent)
                .and_then(|e| e.get_value_by_name(child))
        }) {
            return Ok(SymbolDescriptor::EnumValue(value));
        }
    }

    Err(DescriptorError::NotFound(name.to_string()).into())
}
