//! Tool schemas and a small builder for JSON Schema parameter objects.

use super::error::{ToolError, ToolResult};
use super::traits::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Advertised shape of a tool, as sent to providers and remote peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name(),
            description: tool.description(),
            input_schema: tool.parameters(),
        }
    }

    /// Declared type of a top-level property, if any
    pub fn property_type(&self, property: &str) -> Option<&str> {
        self.input_schema
            .get("properties")
            .and_then(|p| p.get(property))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }
}

/// JSON Schema parameter types
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array(Box<ParamType>),
    Object,
}

impl ParamType {
    pub fn array_of(items: ParamType) -> Self {
        ParamType::Array(Box::new(items))
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Array(items) => json!({"type": "array", "items": items.to_json()}),
            ParamType::Object => json!({"type": "object"}),
        }
    }
}

/// Builds a `ToolSchema` with an object-typed input schema
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    description: String,
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            properties: Map::new(),
            required: Vec::new(),
        }
    }

    pub fn required(mut self, name: &str, ty: ParamType, description: &str) -> Self {
        self.required.push(name.to_string());
        self.optional(name, ty, description)
    }

    pub fn optional(mut self, name: &str, ty: ParamType, description: &str) -> Self {
        let mut prop = ty.to_json();
        if let Value::Object(map) = &mut prop {
            map.insert("description".into(), Value::String(description.into()));
        }
        self.properties.insert(name.to_string(), prop);
        self
    }

    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": Value::Object(self.properties.clone()),
            "required": self.required,
        })
    }

    pub fn build(self) -> ToolSchema {
        let input_schema = self.input_schema();
        ToolSchema {
            name: self.name,
            description: self.description,
            input_schema,
        }
    }
}

/// Reject schemas providers refuse, such as arrays without `items`
pub fn validate_schema(schema: &Value) -> ToolResult<()> {
    validate_node(schema, "$")
}

fn validate_node(node: &Value, path: &str) -> ToolResult<()> {
    let Some(obj) = node.as_object() else {
        return Err(ToolError::InvalidSchema(format!("{} is not an object", path)));
    };

    if obj.get("type").and_then(Value::as_str) == Some("array") {
        match obj.get("items") {
            Some(items) => validate_node(items, &format!("{}.items", path))?,
            None => {
                return Err(ToolError::InvalidSchema(format!(
                    "{} is an array without items",
                    path
                )))
            }
        }
    }

    if let Some(props) = obj.get("properties") {
        let Some(props) = props.as_object() else {
            return Err(ToolError::InvalidSchema(format!(
                "{}.properties is not an object",
                path
            )));
        };
        for (name, prop) in props {
            validate_node(prop, &format!("{}.{}", path, name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_object_schema() {
        let schema = SchemaBuilder::new("search", "Search files")
            .required("query", ParamType::String, "What to look for")
            .optional("limit", ParamType::Integer, "Max hits")
            .optional("paths", ParamType::array_of(ParamType::String), "Roots")
            .build();

        assert_eq!(schema.input_schema["type"], "object");
        assert_eq!(schema.input_schema["required"], json!(["query"]));
        assert_eq!(schema.property_type("limit"), Some("integer"));
        assert_eq!(schema.input_schema["properties"]["paths"]["items"]["type"], "string");
        assert!(validate_schema(&schema.input_schema).is_ok());
    }

    #[test]
    fn test_array_without_items_rejected() {
        let bad = json!({
            "type": "object",
            "properties": {"tags": {"type": "array"}}
        });
        let err = validate_schema(&bad).unwrap_err();
        assert!(err.to_string().contains("$.tags"));
    }
}
