//! Registry of locally implemented tools

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ToolArgs, ToolDispatcher, ToolError, ToolSchema, TypedArgs};
use crate::{Error, Result};

/// A locally implemented tool with a declared schema
pub trait Tool: Send + Sync {
    /// Declaration used for validation and advertised to the remote service
    fn schema(&self) -> ToolSchema;

    /// Run the tool with validated arguments
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Failed` when the tool cannot complete
    fn call(&self, args: &TypedArgs) -> std::result::Result<String, ToolError>;
}

struct Entry {
    schema: ToolSchema,
    tool: Arc<dyn Tool>,
}

/// Dispatches calls to registered tools after validating their arguments
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in tools
    #[must_use]
    pub fn with_builtins() -> Self {
        let builtins: [Arc<dyn Tool>; 1] = [Arc::new(super::CurrentTimeTool)];

        let mut registry = Self::new();
        for tool in builtins {
            let schema = tool.schema();
            registry.tools.insert(schema.name.clone(), Entry { schema, tool });
        }
        registry
    }

    /// Register a tool
    ///
    /// # Errors
    ///
    /// Returns error if a tool with the same name is already registered
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema();
        if self.tools.contains_key(&schema.name) {
            return Err(Error::Tool(format!("duplicate tool: {}", schema.name)));
        }

        tracing::debug!(tool = %schema.name, params = schema.params.len(), "registered tool");
        self.tools.insert(schema.name.clone(), Entry { schema, tool });
        Ok(())
    }

    /// Names of registered tools, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolDispatcher for ToolRegistry {
    fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|e| e.schema.clone()).collect()
    }

    fn execute(&self, name: &str, args: &ToolArgs) -> std::result::Result<String, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;

        let typed = entry.schema.validate(args)?;
        entry.tool.call(&typed)
    }
}
