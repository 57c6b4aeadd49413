//! Typed tool argument schemas
//!
//! The remote service sends loosely-typed arguments (numbers as strings, strings as
//! numbers). Each tool declares its parameters up front and arguments are validated and
//! coerced against that declaration before the tool runs.

use std::collections::BTreeMap;

use super::{ToolArgs, ToolError};

/// Kind of a declared tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    /// Schema type name understood by the dialogue service
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Number => "NUMBER",
            Self::Boolean => "BOOLEAN",
        }
    }
}

/// A single declared parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
    /// Allowed values for string parameters (empty = any)
    pub allowed: Vec<String>,
}

impl ParamSpec {
    /// Declare a required parameter
    #[must_use]
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
            allowed: Vec::new(),
        }
    }

    /// Declare an optional parameter
    #[must_use]
    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    /// Restrict a string parameter to a fixed set of values
    #[must_use]
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|v| (*v).to_string()).collect();
        self
    }
}

/// Declaration of a tool: name, description and parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    /// Create a schema without parameters
    #[must_use]
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Validate raw arguments and coerce them to the declared kinds
    ///
    /// Undeclared arguments are dropped.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::MissingArgument` when a required parameter is absent and
    /// `ToolError::InvalidArgument` when a value cannot be coerced
    pub fn validate(&self, args: &ToolArgs) -> Result<TypedArgs, ToolError> {
        let mut values = BTreeMap::new();

        for spec in &self.params {
            let raw = match args.get(&spec.name) {
                None | Some(serde_json::Value::Null) => {
                    if spec.required {
                        return Err(ToolError::MissingArgument(spec.name.clone()));
                    }
                    continue;
                }
                Some(raw) => raw,
            };

            let value = coerce(spec, raw)?;
            if let ArgValue::Str(s) = &value {
                if !spec.allowed.is_empty() && !spec.allowed.iter().any(|a| a == s) {
                    return Err(ToolError::InvalidArgument {
                        name: spec.name.clone(),
                        reason: format!("expected one of {}", spec.allowed.join(", ")),
                    });
                }
            }
            values.insert(spec.name.clone(), value);
        }

        for name in args.keys() {
            if !self.params.iter().any(|p| &p.name == name) {
                tracing::debug!(tool = %self.name, argument = %name, "ignoring undeclared argument");
            }
        }

        Ok(TypedArgs { values })
    }
}

/// A coerced argument value
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Num(f64),
    Bool(bool),
}

/// Arguments after validation against a `ToolSchema`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedArgs {
    values: BTreeMap<String, ArgValue>,
}

impl TypedArgs {
    /// Get a string argument
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Get an integer argument
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ArgValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a number argument (integers widen)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(ArgValue::Num(n)) => Some(*n),
            Some(ArgValue::Int(i)) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get a boolean argument
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ArgValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Number of present arguments
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no arguments are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn coerce(spec: &ParamSpec, raw: &serde_json::Value) -> Result<ArgValue, ToolError> {
    use serde_json::Value;

    let invalid = |reason: &str| ToolError::InvalidArgument {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };

    match (spec.kind, raw) {
        (ParamKind::String, Value::String(s)) => Ok(ArgValue::Str(s.clone())),
        (ParamKind::String, Value::Number(n)) => Ok(ArgValue::Str(n.to_string())),
        (ParamKind::String, Value::Bool(b)) => Ok(ArgValue::Str(b.to_string())),

        (ParamKind::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(float_to_i64))
            .map(ArgValue::Int)
            .ok_or_else(|| invalid("expected an integer")),
        (ParamKind::Integer, Value::String(s)) => s
            .trim()
            .parse()
            .map(ArgValue::Int)
            .map_err(|_| invalid("expected an integer")),

        (ParamKind::Number, Value::Number(n)) => n
            .as_f64()
            .map(ArgValue::Num)
            .ok_or_else(|| invalid("expected a number")),
        (ParamKind::Number, Value::String(s)) => s
            .trim()
            .parse()
            .map(ArgValue::Num)
            .map_err(|_| invalid("expected a number")),

        (ParamKind::Boolean, Value::Bool(b)) => Ok(ArgValue::Bool(*b)),
        (ParamKind::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(ArgValue::Bool(true)),
            "false" | "no" | "0" => Ok(ArgValue::Bool(false)),
            _ => Err(invalid("expected a boolean")),
        },

        (_, Value::Array(_) | Value::Object(_)) => Err(invalid("expected a scalar value")),
        (kind, _) => Err(invalid(&format!("expected {}", kind.wire_name().to_lowercase()))),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_i64(f: f64) -> i64 {
    f as i64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: serde_json::Value) -> ToolArgs {
        value.as_object().cloned().unwrap_or_default()
    }

    fn timer_schema() -> ToolSchema {
        ToolSchema::new("set_timer", "Start a countdown timer")
            .param(ParamSpec::required("minutes", ParamKind::Integer, "Duration"))
            .param(ParamSpec::optional("label", ParamKind::String, "Timer label"))
            .param(ParamSpec::optional("loud", ParamKind::Boolean, "Ring loudly"))
    }

    #[test]
    fn coerces_numeric_strings() {
        let typed = timer_schema()
            .validate(&args(json!({"minutes": "15", "loud": "yes"})))
            .unwrap();
        assert_eq!(typed.int("minutes"), Some(15));
        assert_eq!(typed.bool("loud"), Some(true));
        assert_eq!(typed.str("label"), None);
    }

    #[test]
    fn accepts_whole_floats_as_integers() {
        let typed = timer_schema().validate(&args(json!({"minutes": 5.0}))).unwrap();
        assert_eq!(typed.int("minutes"), Some(5));
        assert_eq!(typed.number("minutes"), Some(5.0));
    }

    #[test]
    fn rejects_bad_integer() {
        let err = timer_schema()
            .validate(&args(json!({"minutes": "soon"})))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { ref name, .. } if name == "minutes"));
    }

    #[test]
    fn missing_required_argument() {
        let err = timer_schema().validate(&args(json!({"label": "tea"}))).unwrap_err();
        assert!(matches!(err, ToolError::MissingArgument(ref name) if name == "minutes"));
    }

    #[test]
    fn null_counts_as_missing() {
        let typed = timer_schema()
            .validate(&args(json!({"minutes": 1, "label": null})))
            .unwrap();
        assert_eq!(typed.len(), 1);
    }

    #[test]
    fn numbers_become_strings_for_string_params() {
        let typed = timer_schema()
            .validate(&args(json!({"minutes": 1, "label": 42})))
            .unwrap();
        assert_eq!(typed.str("label"), Some("42"));
    }

    #[test]
    fn enforces_allowed_values() {
        let schema = ToolSchema::new("change_voice", "Change voice").param(
            ParamSpec::required("voice_name", ParamKind::String, "Voice").one_of(&["Puck", "Kore"]),
        );
        assert!(schema.validate(&args(json!({"voice_name": "Kore"}))).is_ok());
        assert!(schema.validate(&args(json!({"voice_name": "Robot"}))).is_err());
    }

    #[test]
    fn rejects_structured_values() {
        let err = timer_schema()
            .validate(&args(json!({"minutes": [1, 2]})))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { .. }));
    }

    #[test]
    fn undeclared_arguments_dropped() {
        let typed = timer_schema()
            .validate(&args(json!({"minutes": 3, "color": "red"})))
            .unwrap();
        assert_eq!(typed.len(), 1);
    }
}
