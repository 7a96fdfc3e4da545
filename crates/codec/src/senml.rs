//! The pre-SenML JSON profile: a base name plus an entry array.
//!
//! ```text
//! {"bn":"/3/0/","e":[{"n":"0","sv":"Open Mobile Alliance"},{"n":"1","v":1}]}
//! ```
//!
//! Each entry carries exactly one of `sv` (string, also base64 opaque),
//! `v` (integer/float/time), `bv` (boolean, as the strings `"true"` /
//! `"false"`) or `ov` (object link, `"oid:iid"`). Time values are offset
//! against the optional `bt` base time: encoding emits `stored - bt`,
//! decoding adds it back.

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::Bytes;
use serde_json::{Map, Number, Value};

use crate::{
    Error,
    node::{Node, NodeKind},
    path::{MAX_ID, Path},
    registry::DefinitionRegistry,
    value::{
        ResourceType, decode_boolean, decode_float, decode_integer, decode_object_link,
        encode_boolean, encode_float, encode_integer, encode_object_link,
    },
};

fn entry_value(
    resource_type: ResourceType,
    bytes: &[u8],
    basetime: i64,
) -> Result<(&'static str, Value), Error> {
    Ok(match resource_type.scalar() {
        ResourceType::String => (
            "sv",
            Value::String(std::str::from_utf8(bytes)?.to_string()),
        ),
        ResourceType::Integer => ("v", Value::Number(Number::from(decode_integer(bytes)?))),
        ResourceType::Time => (
            "v",
            Value::Number(Number::from(decode_integer(bytes)? - basetime)),
        ),
        ResourceType::Float => (
            "v",
            Number::from_f64(decode_float(bytes)?)
                .map(Value::Number)
                .ok_or(Error::TypeMismatch)?,
        ),
        ResourceType::Boolean => (
            "bv",
            Value::String(if decode_boolean(bytes)? { "true" } else { "false" }.to_string()),
        ),
        ResourceType::Opaque => ("sv", Value::String(BASE64_STANDARD.encode(bytes))),
        ResourceType::ObjectLink => {
            let (object_id, object_instance_id) = decode_object_link(bytes)?;
            ("ov", Value::String(format!("{object_id}:{object_instance_id}")))
        }
        ResourceType::None => return Err(Error::TypeMismatch),
        _ => unreachable!("scalar() never returns an array type"),
    })
}

fn push_resource(
    entries: &mut Vec<Value>,
    resource: &Node,
    prefix: &str,
    basetime: i64,
) -> Result<(), Error> {
    let resource_type = resource.resource_type().ok_or(Error::TypeMismatch)?;
    let resource_id = resource.id().ok_or(Error::DecodeError)?;

    for instance in resource.children() {
        let name = if resource_type.is_array() {
            format!(
                "{prefix}{resource_id}/{}",
                instance.id().ok_or(Error::DecodeError)?
            )
        } else {
            format!("{prefix}{resource_id}")
        };

        let (key, value) = entry_value(
            resource_type,
            instance.value().ok_or(Error::DecodeError)?,
            basetime,
        )?;

        let mut entry = Map::new();
        entry.insert("n".to_string(), Value::String(name));
        entry.insert(key.to_string(), value);
        entries.push(Value::Object(entry));
    }

    Ok(())
}

fn finish(base: String, basetime: Option<i64>, entries: Vec<Value>) -> Bytes {
    let mut root = Map::new();
    root.insert("bn".to_string(), Value::String(base));
    if let Some(basetime) = basetime {
        root.insert("bt".to_string(), Value::Number(Number::from(basetime)));
    }

    root.insert("e".to_string(), Value::Array(entries));
    Bytes::from(Value::Object(root).to_string().into_bytes())
}

/// Serialize a whole object; entry names are `I/R[/Ri]`.
pub fn encode_object(node: &Node, object_id: u16, basetime: Option<i64>) -> Result<Bytes, Error> {
    let mut entries = Vec::new();
    for instance in node.children() {
        let prefix = format!("{}/", instance.id().ok_or(Error::DecodeError)?);
        for resource in instance.children() {
            push_resource(&mut entries, resource, &prefix, basetime.unwrap_or(0))?;
        }
    }

    Ok(finish(format!("/{object_id}/"), basetime, entries))
}

/// Serialize one object instance; entry names are `R[/Ri]`.
pub fn encode_object_instance(
    node: &Node,
    object_id: u16,
    object_instance_id: u16,
    basetime: Option<i64>,
) -> Result<Bytes, Error> {
    let mut entries = Vec::new();
    for resource in node.children() {
        push_resource(&mut entries, resource, "", basetime.unwrap_or(0))?;
    }

    Ok(finish(
        format!("/{object_id}/{object_instance_id}/"),
        basetime,
        entries,
    ))
}

/// Serialize a single resource; names are empty for a singleton or the
/// resource-instance id for an array.
pub fn encode_resource(
    node: &Node,
    object_id: u16,
    object_instance_id: u16,
    resource_id: u16,
    basetime: Option<i64>,
) -> Result<Bytes, Error> {
    let mut entries = Vec::new();
    let resource_type = node.resource_type().ok_or(Error::TypeMismatch)?;

    for instance in node.children() {
        let name = if resource_type.is_array() {
            instance.id().ok_or(Error::DecodeError)?.to_string()
        } else {
            String::new()
        };

        let (key, value) = entry_value(
            resource_type,
            instance.value().ok_or(Error::DecodeError)?,
            basetime.unwrap_or(0),
        )?;

        let mut entry = Map::new();
        entry.insert("n".to_string(), Value::String(name));
        entry.insert(key.to_string(), value);
        entries.push(Value::Object(entry));
    }

    Ok(finish(
        format!("/{object_id}/{object_instance_id}/{resource_id}/"),
        basetime,
        entries,
    ))
}

fn entry_bytes(
    resource_type: ResourceType,
    entry: &Map<String, Value>,
    basetime: i64,
) -> Result<Bytes, Error> {
    let field = |key: &str| entry.get(key).ok_or(Error::TypeMismatch);

    Ok(match resource_type.scalar() {
        ResourceType::String => Bytes::from(
            field("sv")?
                .as_str()
                .ok_or(Error::TypeMismatch)?
                .as_bytes()
                .to_vec(),
        ),
        ResourceType::Integer => {
            encode_integer(field("v")?.as_i64().ok_or(Error::TypeMismatch)?)
        }
        ResourceType::Time => encode_integer(
            field("v")?
                .as_i64()
                .ok_or(Error::TypeMismatch)?
                .wrapping_add(basetime),
        ),
        ResourceType::Float => encode_float(field("v")?.as_f64().ok_or(Error::TypeMismatch)?),
        ResourceType::Boolean => encode_boolean(match field("bv")? {
            Value::Bool(value) => *value,
            Value::String(value) if value == "true" => true,
            Value::String(value) if value == "false" => false,
            _ => return Err(Error::TypeMismatch),
        }),
        ResourceType::Opaque => Bytes::from(
            BASE64_STANDARD
                .decode(field("sv")?.as_str().ok_or(Error::TypeMismatch)?)
                .map_err(|_| Error::DecodeError)?,
        ),
        ResourceType::ObjectLink => {
            // The original serializer put object links under "sv"; accept
            // either key.
            let text = entry
                .get("ov")
                .or_else(|| entry.get("sv"))
                .ok_or(Error::TypeMismatch)?
                .as_str()
                .ok_or(Error::TypeMismatch)?;

            let (object_id, object_instance_id) =
                text.split_once(':').ok_or(Error::DecodeError)?;

            encode_object_link(
                object_id.parse().map_err(|_| Error::DecodeError)?,
                object_instance_id.parse().map_err(|_| Error::DecodeError)?,
            )
        }
        ResourceType::None => return Err(Error::TypeMismatch),
        _ => unreachable!("scalar() never returns an array type"),
    })
}

struct Payload {
    base: String,
    basetime: i64,
    entries: Vec<Map<String, Value>>,
}

/// Resolve `bn + n` to the resource or resource instance it names.
///
/// Entry names reach below the textual path surface (a multiple-resource
/// entry addresses `/O/I/R/Ri`), so the address is built from parsed
/// components rather than the request-path parser.
fn resolve_entry_name(full: &str) -> Result<Path, Error> {
    let rest = full.strip_prefix('/').ok_or(Error::PathInvalid)?;
    if rest.is_empty() {
        return Err(Error::PathInvalid);
    }

    let ids = rest
        .split('/')
        .map(|segment| crate::path::parse_id(segment, MAX_ID))
        .collect::<Result<Vec<u16>, Error>>()?;

    match ids.as_slice() {
        [object_id, instance_id, resource_id] => {
            Ok(Path::resource(*object_id, *instance_id, *resource_id))
        }
        [object_id, instance_id, resource_id, resource_instance_id] => Ok(
            Path::resource_instance(*object_id, *instance_id, *resource_id, *resource_instance_id),
        ),
        _ => Err(Error::PathInvalid),
    }
}

fn parse_payload(bytes: &[u8]) -> Result<Payload, Error> {
    let root: Value = serde_json::from_slice(bytes).map_err(|_| Error::DecodeError)?;
    let root = root.as_object().ok_or(Error::DecodeError)?;

    let base = root
        .get("bn")
        .map(|it| it.as_str().ok_or(Error::DecodeError))
        .transpose()?
        .unwrap_or("")
        .to_string();

    let basetime = root
        .get("bt")
        .map(|it| it.as_i64().ok_or(Error::DecodeError))
        .transpose()?
        .unwrap_or(0);

    let entries = root
        .get("e")
        .and_then(|it| it.as_array())
        .ok_or(Error::DecodeError)?
        .iter()
        .map(|it| it.as_object().cloned().ok_or(Error::DecodeError))
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(Payload {
        base,
        basetime,
        entries,
    })
}

/// Decode a payload whose entries must all live under `root`.
///
/// The produced tree is rooted at the request level: an `Object` node for
/// `/O`, an `ObjectInstance` for `/O/I`, a `Resource` for `/O/I/R`. Every
/// entry path escaping the root is rejected with [`Error::PathInvalid`].
pub fn decode(
    registry: &DefinitionRegistry,
    root: &Path,
    bytes: &[u8],
) -> Result<Node, Error> {
    registry
        .lookup_object(root.object_id())
        .ok_or(Error::NotDefined)?;

    let payload = parse_payload(bytes)?;

    let mut tree = match (root.object_instance_id(), root.resource_id()) {
        (None, _) => Node::new(NodeKind::Object, Some(root.object_id())),
        (Some(id), None) => Node::new(NodeKind::ObjectInstance, Some(id)),
        (_, Some(id)) => Node::new(NodeKind::Resource, Some(id)),
    };

    for entry in &payload.entries {
        let name = entry
            .get("n")
            .and_then(|it| it.as_str())
            .ok_or(Error::DecodeError)?;

        let full = format!("{}{}", payload.base, name);
        let full = full.strip_suffix('/').unwrap_or(&full);
        let path = resolve_entry_name(full)?;

        if !root.covers(&path) {
            return Err(Error::PathInvalid);
        }

        let resource_id = path.resource_id().unwrap_or_default();
        let definition = registry
            .lookup_resource(path.object_id(), resource_id)
            .ok_or(Error::NotDefined)?;

        if definition.multiple() != path.resource_instance_id().is_some() {
            return Err(Error::TypeMismatch);
        }

        let value = entry_bytes(definition.resource_type, entry, payload.basetime)?;

        let resource = match tree.kind() {
            NodeKind::Object => tree
                .ensure_child(
                    NodeKind::ObjectInstance,
                    Some(path.object_instance_id().ok_or(Error::PathInvalid)?),
                )
                .ensure_child(NodeKind::Resource, Some(resource_id)),
            NodeKind::ObjectInstance => tree.ensure_child(NodeKind::Resource, Some(resource_id)),
            _ => &mut tree,
        };

        resource.set_resource_type(definition.resource_type);
        resource
            .ensure_child(
                NodeKind::ResourceInstance,
                Some(path.resource_instance_id().unwrap_or(0)),
            )
            .set_value(value);
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceOperations;

    fn registry() -> DefinitionRegistry {
        let mut registry = DefinitionRegistry::new();
        registry.register_object("Test", 10000, 0, 10).unwrap();

        for (id, name, resource_type) in [
            (1, "Label", ResourceType::String),
            (2, "Counter", ResourceType::Integer),
            (3, "Enabled", ResourceType::Boolean),
            (4, "Scale", ResourceType::Float),
            (5, "Stamp", ResourceType::Time),
            (6, "Blob", ResourceType::Opaque),
            (7, "Link", ResourceType::ObjectLink),
        ] {
            registry
                .register_resource(
                    10000,
                    id,
                    name,
                    resource_type,
                    0,
                    1,
                    ResourceOperations::ReadWrite,
                    None,
                )
                .unwrap();
        }

        registry
    }

    #[test]
    fn instance_round_trip() {
        let registry = registry();

        let body = br#"{"bn":"/10000/0/","e":[
            {"n":"1","sv":"abc"},
            {"n":"2","v":123456789},
            {"n":"3","bv":"true"},
            {"n":"4","v":2.5},
            {"n":"7","ov":"3:0"}
        ]}"#;

        let tree = decode(&registry, &Path::object_instance(10000, 0), body).unwrap();
        assert_eq!(
            tree.child(2).unwrap().child(0).unwrap().value().unwrap().as_ref(),
            encode_integer(123456789).as_ref(),
        );
        assert_eq!(
            tree.child(3).unwrap().child(0).unwrap().value().unwrap().as_ref(),
            &[1],
        );

        let bytes = encode_object_instance(&tree, 10000, 0, None).unwrap();
        let again = decode(&registry, &Path::object_instance(10000, 0), &bytes).unwrap();
        assert_eq!(
            again.child(4).unwrap().child(0).unwrap().value().unwrap().as_ref(),
            encode_float(2.5).as_ref(),
        );
    }

    #[test]
    fn basetime_offsets_time_values() {
        let registry = registry();

        let body = br#"{"bn":"/10000/0/","bt":1000,"e":[{"n":"5","v":234}]}"#;
        let tree = decode(&registry, &Path::object_instance(10000, 0), body).unwrap();

        assert_eq!(
            tree.child(5).unwrap().child(0).unwrap().value().unwrap().as_ref(),
            encode_integer(1234).as_ref(),
        );

        let bytes = encode_object_instance(&tree, 10000, 0, Some(1000)).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"bt\":1000"), "{text}");
        assert!(text.contains("\"v\":234"), "{text}");
    }

    #[test]
    fn entries_outside_root_rejected() {
        let registry = registry();

        let body = br#"{"bn":"/10000/1/","e":[{"n":"2","v":1}]}"#;
        assert!(matches!(
            decode(&registry, &Path::object_instance(10000, 0), body),
            Err(Error::PathInvalid)
        ));
    }

    #[test]
    fn wrong_value_key_rejected() {
        let registry = registry();

        let body = br#"{"bn":"/10000/0/","e":[{"n":"2","sv":"five"}]}"#;
        assert!(matches!(
            decode(&registry, &Path::object_instance(10000, 0), body),
            Err(Error::TypeMismatch)
        ));
    }

    #[test]
    fn opaque_is_base64() {
        let registry = registry();

        let body = br#"{"bn":"/10000/0/","e":[{"n":"6","sv":"AAEC"}]}"#;
        let tree = decode(&registry, &Path::object_instance(10000, 0), body).unwrap();
        assert_eq!(
            tree.child(6).unwrap().child(0).unwrap().value().unwrap().as_ref(),
            &[0, 1, 2],
        );
    }
}
