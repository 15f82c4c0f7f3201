use std::collections::{HashMap, HashSet};

use prost_reflect::MethodDescriptor;

use crate::descriptor::DescriptorSource;
use crate::error::Result;

/// Resolve a fully-qualified method name to its descriptor.
///
/// Accepts `pkg.Service.Method`, `pkg.Service/Method` and the request path
/// form `/pkg.Service/Method`. Symbols that exist but are not methods fail
/// with `DescriptorError::NotAMethod`.
pub async fn resolve_method(source: &dyn DescriptorSource, name: &str) -> Result<MethodDescriptor> {
    let name = normalize_method_name(name);
    source.find_symbol(&name).await?.into_method()
}

/// `pkg.Service/Method` (optionally with a leading `/`) to `pkg.Service.Method`.
pub fn normalize_method_name(name: &str) -> String {
    let name = name.trim().trim_start_matches('/');
    match name.rsplit_once('/') {
        Some((service, method)) => format!("{service}.{method}"),
        None => name.to_string(),
    }
}

/// The part of a method name after its final `.` or `/`.
pub fn short_method_name(fully_qualified: &str) -> &str {
    fully_qualified
        .rfind(['.', '/'])
        .map_or(fully_qualified, |i| &fully_qualified[i + 1..])
}

/// Every method of every service, grouped by service in sorted order.
pub async fn methods_by_service(
    source: &dyn DescriptorSource,
) -> Result<Vec<(String, Vec<String>)>> {
    let mut grouped = Vec::new();
    for service in source.list_services().await? {
        let methods = source.list_methods(&service).await?;
        grouped.push((service, methods));
    }
    Ok(grouped)
}

/// Short-name collisions within one enumeration of methods.
#[derive(Debug, Clone)]
pub struct Disambiguation {
    methods: Vec<String>,
    ambiguous: HashSet<String>,
}

impl Disambiguation {
    pub fn new(methods: &[String]) -> Self {
        let mut owners: HashMap<&str, HashSet<&str>> = HashMap::new();
        for method in methods {
            owners
                .entry(short_method_name(method))
                .or_default()
                .insert(method.as_str());
        }
        let ambiguous = owners
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(short, _)| short.to_string())
            .collect();

        Disambiguation {
            methods: methods.to_vec(),
            ambiguous,
        }
    }

    /// True when another fully-qualified method shares this one's short name.
    pub fn is_ambiguous(&self, fully_qualified: &str) -> bool {
        self.ambiguous.contains(short_method_name(fully_qualified))
    }

    /// Short names where unique, fully-qualified names where they collide.
    pub fn shortened(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|method| {
                if self.is_ambiguous(method) {
                    method.clone()
                } else {
                    short_method_name(method).to_string()
                }
            })
            .collect()
    }

    /// The enumeration exactly as callers currently receive it: every name
    /// fully qualified, whether or not it collides.
    pub fn reported(&self) -> Vec<String> {
        self.methods.clone()
    }
}

/// The method list handed to callers for selection.
///
/// Collisions are computed but every entry stays fully qualified; see
/// [`Disambiguation::shortened`] for the selectively shortened form.
pub fn nonambiguous_methods(methods: &[String]) -> Vec<String> {
    Disambiguation::new(methods).reported()
}

/// Tree listing: each service on its own line, its methods below it with
/// the `service.` prefix stripped and a tab indent, services separated by a
/// blank line.
pub fn services_methods_output(grouped: &[(String, Vec<String>)]) -> String {
    let mut out = String::new();
    for (service, methods) in grouped {
        out.push_str(service);
        out.push('\n');
        let prefix = format!("{service}.");
        for method in methods {
            out.push('\t');
            out.push_str(method.strip_prefix(&prefix).unwrap_or(method));
            out.push('\n');
        }
        out.push('\n');
    }
    let len = out.trim_end_matches('\n').len();
    out.truncate(len);
    out
}
