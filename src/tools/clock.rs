//! Built-in clock tool

use chrono::Local;

use super::{ParamKind, ParamSpec, Tool, ToolError, ToolSchema, TypedArgs};

/// Reports the local date and time
pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("current_time", "Get the current local date and time").param(
            ParamSpec::optional("format", ParamKind::String, "Clock format: 12h or 24h")
                .one_of(&["12h", "24h"]),
        )
    }

    fn call(&self, args: &TypedArgs) -> Result<String, ToolError> {
        let pattern = match args.str("format") {
            Some("24h") => "%A, %B %-d %Y, %H:%M",
            _ => "%A, %B %-d %Y, %-I:%M %p",
        };
        Ok(Local::now().format(pattern).to_string())
    }
}
