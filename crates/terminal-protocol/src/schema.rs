//! Structural request-schema predicates.
//!
//! Routing needs nothing more than "does this body satisfy that shape", so
//! schemas compile into a [`Predicate`] tree once per service and are cached;
//! evaluation is a pure, allocation-free walk. The accepted vocabulary is the
//! structural core of JSON Schema: `const`, `enum`, `type`, `required`,
//! `properties`, `items`, `allOf`, `anyOf`, `not`. Unknown keywords are
//! ignored rather than rejected, matching the lax mode the original system
//! ran its validators in.

use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// A compiled structural predicate over JSON request bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    root: Node,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Any,
    Never,
    Const(Value),
    Enum(Vec<Value>),
    Types(Vec<TypeTag>),
    Required(Vec<String>),
    Properties(Vec<(String, Node)>),
    Items(Box<Node>),
    AllOf(Vec<Node>),
    AnyOf(Vec<Node>),
    Not(Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Null,
    Boolean,
    Object,
    Array,
    Number,
    Integer,
    String,
}

impl Predicate {
    /// Compile a schema value. Fails on structurally invalid schemas (e.g. a
    /// non-object entry under `properties`), never on unknown keywords.
    pub fn compile(schema: &Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            root: compile_node(schema)?,
        })
    }

    pub fn matches(&self, body: &Value) -> bool {
        eval(&self.root, body)
    }
}

fn compile_node(schema: &Value) -> Result<Node, ProtocolError> {
    match schema {
        Value::Bool(true) => Ok(Node::Any),
        Value::Bool(false) => Ok(Node::Never),
        Value::Object(map) => compile_object(map),
        _ => Err(ProtocolError::InvalidSchema(format!(
            "schema must be an object or boolean, got {schema}"
        ))),
    }
}

fn compile_object(map: &Map<String, Value>) -> Result<Node, ProtocolError> {
    let mut parts: Vec<Node> = Vec::new();

    if let Some(v) = map.get("const") {
        parts.push(Node::Const(v.clone()));
    }
    if let Some(v) = map.get("enum") {
        let items = v
            .as_array()
            .ok_or_else(|| ProtocolError::InvalidSchema("enum must be an array".into()))?;
        parts.push(Node::Enum(items.clone()));
    }
    if let Some(v) = map.get("type") {
        parts.push(Node::Types(compile_types(v)?));
    }
    if let Some(v) = map.get("required") {
        let names = v
            .as_array()
            .ok_or_else(|| ProtocolError::InvalidSchema("required must be an array".into()))?
            .iter()
            .map(|n| {
                n.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ProtocolError::InvalidSchema("required entries must be strings".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        parts.push(Node::Required(names));
    }
    if let Some(v) = map.get("properties") {
        let props = v
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidSchema("properties must be an object".into()))?;
        let mut compiled = Vec::with_capacity(props.len());
        for (name, sub) in props {
            compiled.push((name.clone(), compile_node(sub)?));
        }
        parts.push(Node::Properties(compiled));
    }
    if let Some(v) = map.get("items") {
        parts.push(Node::Items(Box::new(compile_node(v)?)));
    }
    if let Some(v) = map.get("allOf") {
        parts.push(Node::AllOf(compile_list(v, "allOf")?));
    }
    if let Some(v) = map.get("anyOf") {
        parts.push(Node::AnyOf(compile_list(v, "anyOf")?));
    }
    if let Some(v) = map.get("not") {
        parts.push(Node::Not(Box::new(compile_node(v)?)));
    }

    Ok(match parts.len() {
        0 => Node::Any,
        1 => parts.pop().expect("one part"),
        _ => Node::AllOf(parts),
    })
}

fn compile_list(v: &Value, keyword: &str) -> Result<Vec<Node>, ProtocolError> {
    v.as_array()
        .ok_or_else(|| ProtocolError::InvalidSchema(format!("{keyword} must be an array")))?
        .iter()
        .map(compile_node)
        .collect()
}

fn compile_types(v: &Value) -> Result<Vec<TypeTag>, ProtocolError> {
    let one = |s: &str| -> Result<TypeTag, ProtocolError> {
        match s {
            "null" => Ok(TypeTag::Null),
            "boolean" => Ok(TypeTag::Boolean),
            "object" => Ok(TypeTag::Object),
            "array" => Ok(TypeTag::Array),
            "number" => Ok(TypeTag::Number),
            "integer" => Ok(TypeTag::Integer),
            "string" => Ok(TypeTag::String),
            other => Err(ProtocolError::InvalidSchema(format!("unknown type {other}"))),
        }
    };
    match v {
        Value::String(s) => Ok(vec![one(s)?]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| ProtocolError::InvalidSchema("type entries must be strings".into()))
                    .and_then(one)
            })
            .collect(),
        _ => Err(ProtocolError::InvalidSchema("type must be a string or array".into())),
    }
}

fn eval(node: &Node, body: &Value) -> bool {
    match node {
        Node::Any => true,
        Node::Never => false,
        Node::Const(expected) => body == expected,
        Node::Enum(options) => options.iter().any(|v| v == body),
        Node::Types(tags) => tags.iter().any(|tag| type_matches(*tag, body)),
        Node::Required(names) => match body.as_object() {
            Some(map) => names.iter().all(|n| map.contains_key(n)),
            None => false,
        },
        Node::Properties(props) => match body.as_object() {
            Some(map) => props.iter().all(|(name, sub)| {
                // absent properties are unconstrained; required is separate
                map.get(name).map_or(true, |v| eval(sub, v))
            }),
            // non-objects vacuously satisfy property constraints
            None => true,
        },
        Node::Items(sub) => match body.as_array() {
            Some(items) => items.iter().all(|v| eval(sub, v)),
            None => true,
        },
        Node::AllOf(nodes) => nodes.iter().all(|n| eval(n, body)),
        Node::AnyOf(nodes) => nodes.iter().any(|n| eval(n, body)),
        Node::Not(sub) => !eval(sub, body),
    }
}

fn type_matches(tag: TypeTag, body: &Value) -> bool {
    match tag {
        TypeTag::Null => body.is_null(),
        TypeTag::Boolean => body.is_boolean(),
        TypeTag::Object => body.is_object(),
        TypeTag::Array => body.is_array(),
        TypeTag::String => body.is_string(),
        TypeTag::Number => body.is_number(),
        TypeTag::Integer => match body.as_f64() {
            Some(f) => f.fract() == 0.0,
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_schema_accepts_everything() {
        let p = Predicate::compile(&json!({})).unwrap();
        assert!(p.matches(&json!(null)));
        assert!(p.matches(&json!({"a": 1})));
    }

    #[test]
    fn required_and_typed_properties() {
        let p = Predicate::compile(&json!({
            "type": "object",
            "required": ["datasource_id"],
            "properties": {
                "datasource_id": { "type": "string" },
                "limit": { "type": "integer" }
            }
        }))
        .unwrap();
        assert!(p.matches(&json!({"datasource_id": "binance"})));
        assert!(p.matches(&json!({"datasource_id": "binance", "limit": 10})));
        assert!(!p.matches(&json!({"datasource_id": 5})));
        assert!(!p.matches(&json!({"limit": 10})));
        assert!(!p.matches(&json!("binance")));
    }

    #[test]
    fn const_discriminates_services_sharing_a_method() {
        let a = Predicate::compile(&json!({
            "properties": { "exchange": { "const": "OKX" } },
            "required": ["exchange"]
        }))
        .unwrap();
        let b = Predicate::compile(&json!({
            "properties": { "exchange": { "const": "Binance" } },
            "required": ["exchange"]
        }))
        .unwrap();
        let req = json!({"exchange": "OKX", "order_id": "1"});
        assert!(a.matches(&req));
        assert!(!b.matches(&req));
    }

    #[test]
    fn combinators() {
        let p = Predicate::compile(&json!({
            "anyOf": [
                { "type": "string" },
                { "type": "object", "required": ["id"] }
            ],
            "not": { "const": "forbidden" }
        }))
        .unwrap();
        assert!(p.matches(&json!("hello")));
        assert!(p.matches(&json!({"id": 1})));
        assert!(!p.matches(&json!("forbidden")));
        assert!(!p.matches(&json!({})));
    }

    #[test]
    fn invalid_schema_is_rejected_at_compile_time() {
        assert!(Predicate::compile(&json!({"required": "name"})).is_err());
        assert!(Predicate::compile(&json!({"type": "frobnicate"})).is_err());
        assert!(Predicate::compile(&json!(12)).is_err());
    }
}
