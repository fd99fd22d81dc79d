//! JSON-Schema → tool descriptor conversion.
//!
//! Remote tools declare an `inputSchema`; the converter turns it into a
//! typed parameter list the upstream surface can expose and the dispatcher
//! can enforce (required parameters, default injection, optional omission).

use serde_json::{Map, Value, json};

/// Local view of a JSON-Schema parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Float,
    Int,
    Bool,
    Map,
    List,
    Null,
    /// Unknown schema type; accepted and passed through opaquely.
    Any,
}

impl ParamType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Float => "float",
            ParamType::Int => "int",
            ParamType::Bool => "bool",
            ParamType::Map => "map",
            ParamType::List => "list",
            ParamType::Null => "none",
            ParamType::Any => "any",
        }
    }

    fn from_schema_name(name: &str) -> ParamType {
        match name {
            "string" => ParamType::String,
            "number" => ParamType::Float,
            "integer" => ParamType::Int,
            "boolean" => ParamType::Bool,
            "object" => ParamType::Map,
            "array" => ParamType::List,
            "null" => ParamType::Null,
            _ => ParamType::Any,
        }
    }

    fn schema_name(self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Float => Some("number"),
            ParamType::Int => Some("integer"),
            ParamType::Bool => Some("boolean"),
            ParamType::Map => Some("object"),
            ParamType::List => Some("array"),
            ParamType::Null => Some("null"),
            ParamType::Any => None,
        }
    }
}

/// One parameter of a converted tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    pub ty: ParamType,
    /// Caller must supply the value; never carries a default.
    pub required: bool,
    /// Nullable/omittable; an omitted optional is absent from the dispatched
    /// payload (null is not injected).
    pub optional: bool,
    pub default: Option<Value>,
    pub description: String,
}

/// A remote tool converted into a locally typed, namespaced descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Fully-qualified exposed name: `mcp_<prefix>_<tool>` with hyphens
    /// mapped to underscores.
    pub full_name: String,
    /// Name the child knows the tool by; used for dispatch.
    pub original_name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    /// Regenerate a JSON-Schema object for upstream exposure.
    #[must_use]
    pub fn input_schema(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = Map::new();
            if let Some(name) = param.ty.schema_name() {
                if param.optional && param.ty != ParamType::Null {
                    prop.insert("type".into(), json!([name, "null"]));
                } else {
                    prop.insert("type".into(), json!(name));
                }
            }
            if !param.description.is_empty() {
                prop.insert("description".into(), json!(param.description));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), json!("object"));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        schema
    }

    /// Build the payload dispatched to the child: required parameters
    /// enforced, defaults injected, absent optionals omitted. Extra caller
    /// keys pass through untouched.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first missing required parameter.
    pub fn build_payload(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, String> {
        let mut payload = Map::new();
        for param in &self.parameters {
            match args.get(&param.name) {
                Some(value) => {
                    payload.insert(param.name.clone(), value.clone());
                }
                None if param.required => {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                None => {
                    if let Some(default) = &param.default {
                        payload.insert(param.name.clone(), default.clone());
                    }
                    // No default: leave the key out entirely.
                }
            }
        }
        for (key, value) in args {
            payload.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(payload)
    }
}

/// Compose the fully-qualified exposed name.
#[must_use]
pub fn full_tool_name(prefix: &str, tool_name: &str) -> String {
    format!("mcp_{prefix}_{}", tool_name.replace('-', "_"))
}

/// Resolve a property schema's `type` into a local type plus nullability.
/// A type array containing `"null"` yields the optional form of the first
/// non-null member.
fn parse_type(prop: &Value) -> (ParamType, bool) {
    match prop.get("type") {
        Some(Value::String(name)) => (ParamType::from_schema_name(name), false),
        Some(Value::Array(members)) => {
            let names: Vec<&str> = members.iter().filter_map(Value::as_str).collect();
            let nullable = names.contains(&"null");
            let base = names
                .iter()
                .find(|n| **n != "null")
                .map(|n| ParamType::from_schema_name(n))
                .unwrap_or(ParamType::Null);
            (base, nullable)
        }
        // The wire default for untyped properties.
        None => (ParamType::String, false),
        Some(_) => (ParamType::Any, false),
    }
}

/// Check a tool definition is convertible. Complex parameter types (object/
/// array) are accepted with a warning and pass through opaquely.
///
/// # Errors
///
/// Returns a message describing the first structural problem.
pub fn validate_tool(definition: &Value) -> Result<(), String> {
    let Some(tool) = definition.as_object() else {
        return Err("tool definition must be an object".into());
    };
    let Some(name) = tool.get("name").and_then(Value::as_str) else {
        return Err("tool definition missing 'name' field".into());
    };

    let Some(schema) = tool.get("inputSchema") else {
        // Tools without inputs are fine.
        return Ok(());
    };
    let Some(schema) = schema.as_object() else {
        return Err("inputSchema must be an object".into());
    };

    if let Some(properties) = schema.get("properties") {
        let Some(properties) = properties.as_object() else {
            return Err("inputSchema.properties must be an object".into());
        };
        for (prop_name, prop) in properties {
            let (ty, _) = parse_type(prop);
            if matches!(ty, ParamType::Map | ParamType::List) {
                tracing::warn!(
                    tool = %name,
                    parameter = %prop_name,
                    kind = %ty.as_str(),
                    "complex parameter type passes through opaquely"
                );
            }
        }
    }
    Ok(())
}

/// Convert a validated tool definition into a descriptor namespaced under
/// `prefix`.
///
/// # Errors
///
/// Returns the validation message for definitions `validate_tool` rejects.
pub fn convert_tool(definition: &Value, prefix: &str) -> Result<ToolDescriptor, String> {
    validate_tool(definition)?;

    let name = definition["name"].as_str().unwrap_or("unknown").to_string();
    let description = definition
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let empty = Map::new();
    let schema = definition
        .get("inputSchema")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut parameters = Vec::with_capacity(properties.len());
    for (prop_name, prop) in properties {
        let (ty, nullable) = parse_type(prop);
        let is_required = required.contains(&prop_name.as_str());
        let default = if is_required {
            None
        } else {
            prop.get("default").cloned()
        };
        // Optional without a default becomes omittable.
        let optional = !is_required && (nullable || default.is_none());
        parameters.push(ToolParameter {
            name: prop_name.clone(),
            ty,
            required: is_required,
            optional,
            default,
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    Ok(ToolDescriptor {
        full_name: full_tool_name(prefix, &name),
        original_name: name,
        description,
        parameters,
    })
}
