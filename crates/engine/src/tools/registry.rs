//! Tool Registry — name -> descriptor. Tool-set composition (policy
//! filtering, per-agent allow/deny) is left to the caller; the registry
//! itself is a flat lookup, following the shape of
//! `build_tool_definitions`'s underlying name -> descriptor map in the
//! gateway this engine replaces the turn loop of.

use std::collections::HashMap;

use sa_domain::http_tool::ToolDescriptor;
use sa_domain::tool::ToolDefinition;

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|d| ToolDefinition {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.parameters_schema.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::http_tool::ToolKind;

    #[test]
    fn register_then_get_round_trips() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor {
            id: "get_time".into(),
            name: "get_time".into(),
            kind: ToolKind::Local,
            description: "returns the current time".into(),
            parameters_schema: serde_json::json!({}),
        });
        assert!(registry.get("get_time").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.definitions().len(), 1);
    }
}
