//! Capability registry: name -> handler lookup with a declared parameter
//! shape. TOOL_CALL steps resolve their handler here; the step executor
//! filters invocation arguments down to the declared set before calling,
//! so templates can carry extra routing keys without breaking handlers.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A named, invocable capability (search, scraping, memory store, ...).
/// Implementations live outside the core; the engine only consumes this
/// contract.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Argument names this capability accepts. Anything else is dropped
    /// before invocation.
    fn declared_parameters(&self) -> &[&str];

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value>;
}

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    /// Keep only the arguments the capability declares.
    pub fn filter_args(
        capability: &dyn Capability,
        args: Map<String, Value>,
    ) -> Map<String, Value> {
        let declared = capability.declared_parameters();
        args.into_iter()
            .filter(|(k, _)| declared.contains(&k.as_str()))
            .collect()
    }
}
