//! Tool registry: maps a tool name to its descriptor and, for `local`
//! mode, the host-provided function that implements it.

use std::collections::HashMap;
use std::sync::Arc;

use arena_domain::tool::ToolDefinition;
use arena_domain::tool_descriptor::{ToolDescriptor, ToolMode};

use crate::executor::LocalToolFn;

/// Declares the pack's callable tools. Immutable during a run (spec §3
/// "Tool Descriptor" — "lives in the pack; immutable during a run").
#[derive(Default, Clone)]
pub struct ToolRegistry {
    descriptors: HashMap<String, ToolDescriptor>,
    local_fns: HashMap<String, LocalToolFn>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut reg = Self::new();
        for d in descriptors {
            reg.register(d);
        }
        reg
    }

    /// Register the host-provided implementation of a `local`-mode tool.
    /// Panics in debug builds if no descriptor of that name exists, since
    /// that indicates a pack/host wiring mistake caught best at startup.
    pub fn register_local_fn(&mut self, name: impl Into<String>, f: LocalToolFn) {
        let name = name.into();
        debug_assert!(
            self.descriptors.contains_key(&name),
            "registering a local fn for undeclared tool `{name}`"
        );
        self.local_fns.insert(name, f);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    pub fn local_fn(&self, name: &str) -> Option<&LocalToolFn> {
        self.local_fns.get(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(|s| s.as_str())
    }

    /// Render tool descriptors into the provider-neutral `ToolDefinition`
    /// shape the Pipeline's ToolBinder middleware attaches to the request,
    /// filtered by the prompt's allow-list and the policy's blocklist
    /// (spec §4.6 step 4).
    pub fn bind(
        &self,
        allow_list: Option<&[String]>,
        blocklist: &[String],
    ) -> Vec<ToolDefinition> {
        self.descriptors
            .values()
            .filter(|d| allow_list.map_or(true, |allow| allow.iter().any(|n| n == &d.name)))
            .filter(|d| !blocklist.iter().any(|b| b == &d.name))
            .map(|d| ToolDefinition {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            })
            .collect()
    }
}

pub fn is_async_capable(mode: &ToolMode) -> bool {
    matches!(mode, ToolMode::Http(_) | ToolMode::Mcp(_))
}
