//! Schema-driven value codec.
//!
//! Providers exchange values as `DynamicValue` envelopes: msgpack (primary)
//! or JSON (fallback) bytes whose shape is dictated by a schema-derived
//! type. Callers work with untyped `serde_json` values; this module converts
//! between the two in both directions.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value as Json;
use tracing::warn;

use super::tfplugin6;
use super::tfplugin6::schema::nested_block::NestingMode as BlockNesting;
use super::tfplugin6::schema::object::NestingMode as ObjectNesting;

/// A type in the provider value system, mirroring the JSON type expressions
/// used on the wire (`"string"`, `["list","number"]`, `["object",{...}]`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    /// Type decided by the value itself; wire-encoded as a `[type, value]` pair.
    Dynamic,
    Bool,
    Number,
    String,
    List(Box<ValueType>),
    Set(Box<ValueType>),
    Map(Box<ValueType>),
    Object(BTreeMap<String, ValueType>),
    Tuple(Vec<ValueType>),
}

/// Build the structural object type for a schema block: one entry per
/// attribute plus one per nested block, wrapped by its nesting mode.
pub fn block_type(block: &tfplugin6::schema::Block) -> Result<ValueType> {
    let mut attrs = BTreeMap::new();

    for attr in &block.attributes {
        attrs.insert(attr.name.clone(), attribute_type(attr)?);
    }

    for nested in &block.block_types {
        let inner = match &nested.block {
            Some(block) => block_type(block)?,
            None => ValueType::Object(BTreeMap::new()),
        };
        let wrapped = match BlockNesting::try_from(nested.nesting) {
            Ok(BlockNesting::Single | BlockNesting::Group) => inner,
            Ok(BlockNesting::List) => ValueType::List(Box::new(inner)),
            Ok(BlockNesting::Set) => ValueType::Set(Box::new(inner)),
            Ok(BlockNesting::Map) => ValueType::Map(Box::new(inner)),
            _ => continue,
        };
        attrs.insert(nested.type_name.clone(), wrapped);
    }

    Ok(ValueType::Object(attrs))
}

fn attribute_type(attr: &tfplugin6::schema::Attribute) -> Result<ValueType> {
    if let Some(nested) = &attr.nested_type {
        return object_type(nested)
            .with_context(|| format!("invalid nested type for attribute {:?}", attr.name));
    }
    if !attr.r#type.is_empty() {
        let expr: Json = serde_json::from_slice(&attr.r#type)
            .with_context(|| format!("invalid type expression for attribute {:?}", attr.name))?;
        return parse_type(&expr)
            .with_context(|| format!("invalid type expression for attribute {:?}", attr.name));
    }
    Ok(ValueType::Dynamic)
}

fn object_type(obj: &tfplugin6::schema::Object) -> Result<ValueType> {
    let mut attrs = BTreeMap::new();
    for attr in &obj.attributes {
        attrs.insert(attr.name.clone(), attribute_type(attr)?);
    }
    let object = ValueType::Object(attrs);

    Ok(match ObjectNesting::try_from(obj.nesting) {
        Ok(ObjectNesting::List) => ValueType::List(Box::new(object)),
        Ok(ObjectNesting::Set) => ValueType::Set(Box::new(object)),
        Ok(ObjectNesting::Map) => ValueType::Map(Box::new(object)),
        _ => object,
    })
}

/// Parse a JSON type expression into a [`ValueType`].
pub fn parse_type(expr: &Json) -> Result<ValueType> {
    match expr {
        Json::String(kind) => match kind.as_str() {
            "bool" => Ok(ValueType::Bool),
            "number" => Ok(ValueType::Number),
            "string" => Ok(ValueType::String),
            "dynamic" => Ok(ValueType::Dynamic),
            other => bail!("unknown primitive type {other:?}"),
        },
        Json::Array(parts) => {
            let kind = parts
                .first()
                .and_then(Json::as_str)
                .ok_or_else(|| anyhow!("malformed type expression: {expr}"))?;
            let arg = parts
                .get(1)
                .ok_or_else(|| anyhow!("type expression {kind:?} missing argument"))?;
            match kind {
                "list" => Ok(ValueType::List(Box::new(parse_type(arg)?))),
                "set" => Ok(ValueType::Set(Box::new(parse_type(arg)?))),
                "map" => Ok(ValueType::Map(Box::new(parse_type(arg)?))),
                "object" => {
                    // A third element may list optional attribute names; it
                    // does not affect the structural type.
                    let fields = arg
                        .as_object()
                        .ok_or_else(|| anyhow!("object type argument must be a mapping"))?;
                    let mut attrs = BTreeMap::new();
                    for (name, field_expr) in fields {
                        attrs.insert(name.clone(), parse_type(field_expr)?);
                    }
                    Ok(ValueType::Object(attrs))
                }
                "tuple" => {
                    let elems = arg
                        .as_array()
                        .ok_or_else(|| anyhow!("tuple type argument must be a sequence"))?;
                    let types = elems.iter().map(parse_type).collect::<Result<Vec<_>>>()?;
                    Ok(ValueType::Tuple(types))
                }
                other => bail!("unknown compound type {other:?}"),
            }
        }
        other => bail!("malformed type expression: {other}"),
    }
}

/// Serialize a [`ValueType`] back to its JSON type expression.
fn type_expression(ty: &ValueType) -> Json {
    match ty {
        ValueType::Dynamic => Json::String("dynamic".into()),
        ValueType::Bool => Json::String("bool".into()),
        ValueType::Number => Json::String("number".into()),
        ValueType::String => Json::String("string".into()),
        ValueType::List(elem) => serde_json::json!(["list", type_expression(elem)]),
        ValueType::Set(elem) => serde_json::json!(["set", type_expression(elem)]),
        ValueType::Map(elem) => serde_json::json!(["map", type_expression(elem)]),
        ValueType::Object(attrs) => {
            let fields: serde_json::Map<String, Json> = attrs
                .iter()
                .map(|(name, ty)| (name.clone(), type_expression(ty)))
                .collect();
            serde_json::json!(["object", fields])
        }
        ValueType::Tuple(elems) => {
            let types: Vec<Json> = elems.iter().map(type_expression).collect();
            serde_json::json!(["tuple", types])
        }
    }
}

/// The exact type of an untyped value, used when encoding under `Dynamic`.
fn infer_type(value: &Json) -> ValueType {
    match value {
        Json::Null => ValueType::Dynamic,
        Json::Bool(_) => ValueType::Bool,
        Json::Number(_) => ValueType::Number,
        Json::String(_) => ValueType::String,
        Json::Array(elems) => ValueType::Tuple(elems.iter().map(infer_type).collect()),
        Json::Object(fields) => ValueType::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), infer_type(v)))
                .collect(),
        ),
    }
}

/// Encode an untyped value under `ty` as msgpack bytes ready for a
/// `DynamicValue` envelope. A null input yields a null typed value.
pub fn encode(value: &Json, ty: &ValueType) -> Result<Vec<u8>> {
    let packed = to_msgpack(value, ty)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &packed).context("failed to encode msgpack value")?;
    Ok(buf)
}

fn to_msgpack(value: &Json, ty: &ValueType) -> Result<rmpv::Value> {
    if value.is_null() {
        return Ok(rmpv::Value::Nil);
    }

    match ty {
        ValueType::Dynamic => {
            // Dynamic values carry their own type on the wire as a
            // [type-bytes, value] pair.
            let inferred = infer_type(value);
            let type_bytes = serde_json::to_vec(&type_expression(&inferred))?;
            Ok(rmpv::Value::Array(vec![
                rmpv::Value::Binary(type_bytes),
                to_msgpack(value, &inferred)?,
            ]))
        }
        ValueType::Bool => value
            .as_bool()
            .map(rmpv::Value::Boolean)
            .ok_or_else(|| anyhow!("expected bool, got {value}")),
        ValueType::Number => {
            let number = value
                .as_number()
                .ok_or_else(|| anyhow!("expected number, got {value}"))?;
            if let Some(n) = number.as_i64() {
                Ok(rmpv::Value::from(n))
            } else if let Some(n) = number.as_u64() {
                Ok(rmpv::Value::from(n))
            } else {
                Ok(rmpv::Value::F64(number.as_f64().unwrap_or(f64::NAN)))
            }
        }
        ValueType::String => value
            .as_str()
            .map(|s| rmpv::Value::from(s.to_string()))
            .ok_or_else(|| anyhow!("expected string, got {value}")),
        ValueType::List(elem) | ValueType::Set(elem) => {
            let items = value
                .as_array()
                .ok_or_else(|| anyhow!("expected sequence, got {value}"))?;
            let packed = items
                .iter()
                .map(|item| to_msgpack(item, elem))
                .collect::<Result<Vec<_>>>()?;
            Ok(rmpv::Value::Array(packed))
        }
        ValueType::Map(elem) => {
            let entries = value
                .as_object()
                .ok_or_else(|| anyhow!("expected mapping, got {value}"))?;
            let packed = entries
                .iter()
                .map(|(key, item)| {
                    Ok((rmpv::Value::from(key.clone()), to_msgpack(item, elem)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(rmpv::Value::Map(packed))
        }
        ValueType::Object(attrs) => {
            let fields = value
                .as_object()
                .ok_or_else(|| anyhow!("expected object, got {value}"))?;
            if let Some(unknown) = fields.keys().find(|key| !attrs.contains_key(*key)) {
                bail!("unexpected attribute {unknown:?}");
            }
            // Every attribute of the object type is present on the wire;
            // absent input attributes encode as null.
            let packed = attrs
                .iter()
                .map(|(name, attr_ty)| {
                    let encoded = match fields.get(name) {
                        Some(item) => to_msgpack(item, attr_ty)
                            .with_context(|| format!("attribute {name:?}"))?,
                        None => rmpv::Value::Nil,
                    };
                    Ok((rmpv::Value::from(name.clone()), encoded))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(rmpv::Value::Map(packed))
        }
        ValueType::Tuple(elems) => {
            let items = value
                .as_array()
                .ok_or_else(|| anyhow!("expected sequence, got {value}"))?;
            if items.len() != elems.len() {
                bail!(
                    "tuple length mismatch: expected {}, got {}",
                    elems.len(),
                    items.len()
                );
            }
            let packed = items
                .iter()
                .zip(elems)
                .map(|(item, elem_ty)| to_msgpack(item, elem_ty))
                .collect::<Result<Vec<_>>>()?;
            Ok(rmpv::Value::Array(packed))
        }
    }
}

/// Decode a `DynamicValue` envelope under `ty` into an untyped value,
/// preferring the msgpack payload over the JSON fallback. An empty envelope
/// decodes to null.
pub fn decode(dv: &tfplugin6::DynamicValue, ty: &ValueType) -> Result<Json> {
    if !dv.msgpack.is_empty() {
        let raw = rmpv::decode::read_value(&mut dv.msgpack.as_slice())
            .context("failed to decode msgpack payload")?;
        return from_msgpack(&raw, ty);
    }
    if !dv.json.is_empty() {
        return serde_json::from_slice(&dv.json).context("failed to decode json payload");
    }
    Ok(Json::Null)
}

fn from_msgpack(raw: &rmpv::Value, ty: &ValueType) -> Result<Json> {
    match raw {
        rmpv::Value::Nil => return Ok(Json::Null),
        // Extension 0 marks a value the provider has not computed yet.
        rmpv::Value::Ext(0, _) => return Ok(Json::Null),
        _ => {}
    }

    match ty {
        ValueType::Dynamic => {
            if let rmpv::Value::Array(parts) = raw {
                if parts.len() == 2 {
                    if let Some(type_bytes) = binary_or_str(&parts[0]) {
                        let expr: Json = serde_json::from_slice(&type_bytes)
                            .context("failed to decode dynamic value type")?;
                        let inner = parse_type(&expr)?;
                        return from_msgpack(&parts[1], &inner);
                    }
                }
            }
            Ok(decode_any(raw))
        }
        ValueType::Bool => match raw {
            rmpv::Value::Boolean(b) => Ok(Json::Bool(*b)),
            other => bail!("expected bool on the wire, got {other}"),
        },
        ValueType::Number => decode_number(raw),
        ValueType::String => match raw {
            rmpv::Value::String(s) => Ok(Json::String(s.as_str().unwrap_or_default().into())),
            other => bail!("expected string on the wire, got {other}"),
        },
        ValueType::List(elem) | ValueType::Set(elem) => match raw {
            rmpv::Value::Array(items) => {
                let decoded = items
                    .iter()
                    .map(|item| from_msgpack(item, elem))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Json::Array(decoded))
            }
            other => bail!("expected sequence on the wire, got {other}"),
        },
        ValueType::Map(elem) => match raw {
            rmpv::Value::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    map.insert(map_key(key), from_msgpack(item, elem)?);
                }
                Ok(Json::Object(map))
            }
            other => bail!("expected mapping on the wire, got {other}"),
        },
        ValueType::Object(attrs) => match raw {
            rmpv::Value::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    let name = map_key(key);
                    let decoded = match attrs.get(&name) {
                        Some(attr_ty) => from_msgpack(item, attr_ty)
                            .with_context(|| format!("attribute {name:?}"))?,
                        None => decode_any(item),
                    };
                    map.insert(name, decoded);
                }
                Ok(Json::Object(map))
            }
            other => bail!("expected object on the wire, got {other}"),
        },
        ValueType::Tuple(elems) => match raw {
            rmpv::Value::Array(items) if items.len() == elems.len() => {
                let decoded = items
                    .iter()
                    .zip(elems)
                    .map(|(item, elem_ty)| from_msgpack(item, elem_ty))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Json::Array(decoded))
            }
            other => bail!("expected {}-tuple on the wire, got {other}", elems.len()),
        },
    }
}

fn decode_number(raw: &rmpv::Value) -> Result<Json> {
    match raw {
        rmpv::Value::Integer(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Json::from(v))
            } else if let Some(v) = n.as_u64() {
                Ok(Json::from(v))
            } else {
                bail!("integer out of range")
            }
        }
        rmpv::Value::F32(f) => Ok(serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null)),
        rmpv::Value::F64(f) => Ok(serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null)),
        // Numbers that overflow the binary formats travel as strings.
        rmpv::Value::String(s) => {
            let text = s.as_str().unwrap_or_default();
            if let Ok(v) = text.parse::<i64>() {
                Ok(Json::from(v))
            } else if let Ok(v) = text.parse::<f64>() {
                Ok(serde_json::Number::from_f64(v)
                    .map(Json::Number)
                    .unwrap_or(Json::Null))
            } else {
                bail!("expected number on the wire, got {text:?}")
            }
        }
        other => bail!("expected number on the wire, got {other}"),
    }
}

/// Best-effort conversion when no type information is available.
fn decode_any(raw: &rmpv::Value) -> Json {
    match raw {
        rmpv::Value::Nil | rmpv::Value::Ext(..) => Json::Null,
        rmpv::Value::Boolean(b) => Json::Bool(*b),
        rmpv::Value::Integer(n) => n
            .as_i64()
            .map(Json::from)
            .or_else(|| n.as_u64().map(Json::from))
            .unwrap_or(Json::Null),
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        rmpv::Value::String(s) => Json::String(s.as_str().unwrap_or_default().into()),
        rmpv::Value::Binary(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
        rmpv::Value::Array(items) => Json::Array(items.iter().map(decode_any).collect()),
        rmpv::Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(key, item)| (map_key(key), decode_any(item)))
                .collect(),
        ),
    }
}

fn binary_or_str(value: &rmpv::Value) -> Option<Vec<u8>> {
    match value {
        rmpv::Value::Binary(bytes) => Some(bytes.clone()),
        rmpv::Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn map_key(key: &rmpv::Value) -> String {
    match key {
        rmpv::Value::String(s) => s.as_str().unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

/// Fail on the first error-severity diagnostic, surfacing it as
/// `summary: detail`. Warnings are logged and otherwise ignored.
pub fn check_diagnostics(diagnostics: &[tfplugin6::Diagnostic]) -> Result<()> {
    for diag in diagnostics {
        match tfplugin6::diagnostic::Severity::try_from(diag.severity) {
            Ok(tfplugin6::diagnostic::Severity::Error) => {
                if diag.detail.is_empty() {
                    bail!("{}", diag.summary);
                }
                bail!("{}: {}", diag.summary, diag.detail);
            }
            Ok(tfplugin6::diagnostic::Severity::Warning) => {
                warn!(summary = %diag.summary, "provider warning");
            }
            _ => {}
        }
    }
    Ok(())
}
