//! Plain text, for single scalar resources only.
//!
//! Integers and Times are signed decimals, Floats decimal (scientific
//! notation accepted on decode), Booleans `0`/`1`, Strings raw bytes,
//! ObjectLinks `oid:iid`. Opaque resources never travel as plain text.

use bytes::Bytes;

use crate::{
    Error,
    node::{Node, NodeKind},
    registry::DefinitionRegistry,
    value::{
        ResourceType, decode_boolean, decode_float, decode_integer, decode_object_link,
        encode_boolean, encode_float, encode_integer, encode_object_link,
    },
};

/// Serialize a singleton resource value.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::node::{Node, NodeKind};
/// use lwm2m_stack_codec::value::{ResourceType, encode_integer};
/// use lwm2m_stack_codec::text;
///
/// let mut resource = Node::new(NodeKind::Resource, Some(0));
/// resource.set_resource_type(ResourceType::Integer);
/// resource.add_child(Node::with_value(
///     NodeKind::ResourceInstance,
///     Some(0),
///     encode_integer(-42),
/// ));
///
/// assert_eq!(text::encode_resource(&resource).unwrap().as_ref(), b"-42");
/// ```
pub fn encode_resource(node: &Node) -> Result<Bytes, Error> {
    let resource_type = node.resource_type().ok_or(Error::TypeMismatch)?;
    if resource_type.is_array() {
        return Err(Error::CodecNotFound);
    }

    let value = match node.value() {
        Some(value) => value.clone(),
        None => node
            .first_child()
            .and_then(|it| it.value())
            .ok_or(Error::NotFound)?
            .clone(),
    };

    Ok(match resource_type {
        ResourceType::String => value,
        ResourceType::Integer | ResourceType::Time => {
            Bytes::from(decode_integer(&value)?.to_string().into_bytes())
        }
        ResourceType::Float => Bytes::from(decode_float(&value)?.to_string().into_bytes()),
        ResourceType::Boolean => {
            Bytes::from_static(if decode_boolean(&value)? { b"1" } else { b"0" })
        }
        ResourceType::ObjectLink => {
            let (object_id, object_instance_id) = decode_object_link(&value)?;
            Bytes::from(format!("{object_id}:{object_instance_id}").into_bytes())
        }
        _ => return Err(Error::TypeMismatch),
    })
}

/// Parse a plain-text payload against a singleton resource definition.
pub fn decode_resource(
    registry: &DefinitionRegistry,
    object_id: u16,
    resource_id: u16,
    bytes: &[u8],
) -> Result<Node, Error> {
    let definition = registry
        .lookup_resource(object_id, resource_id)
        .ok_or(Error::NotDefined)?;

    if definition.multiple() {
        return Err(Error::CodecNotFound);
    }

    let value = match definition.resource_type {
        ResourceType::String => Bytes::copy_from_slice(bytes),
        ResourceType::Integer | ResourceType::Time => encode_integer(
            std::str::from_utf8(bytes)?
                .parse::<i64>()
                .map_err(|_| Error::DecodeError)?,
        ),
        ResourceType::Float => encode_float(
            std::str::from_utf8(bytes)?
                .parse::<f64>()
                .map_err(|_| Error::DecodeError)?,
        ),
        ResourceType::Boolean => match bytes {
            b"0" => encode_boolean(false),
            b"1" => encode_boolean(true),
            _ => return Err(Error::DecodeError),
        },
        ResourceType::ObjectLink => {
            let text = std::str::from_utf8(bytes)?;
            let (object_id, object_instance_id) =
                text.split_once(':').ok_or(Error::DecodeError)?;

            encode_object_link(
                object_id.parse().map_err(|_| Error::DecodeError)?,
                object_instance_id.parse().map_err(|_| Error::DecodeError)?,
            )
        }
        _ => return Err(Error::TypeMismatch),
    };

    let mut resource = Node::new(NodeKind::Resource, Some(resource_id));
    resource.set_resource_type(definition.resource_type);
    resource.add_child(Node::with_value(NodeKind::ResourceInstance, Some(0), value));

    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceOperations;

    fn registry() -> DefinitionRegistry {
        let mut registry = DefinitionRegistry::new();
        registry.register_object("Test", 20000, 0, 1).unwrap();

        for (id, name, resource_type) in [
            (0, "Label", ResourceType::String),
            (1, "Counter", ResourceType::Integer),
            (2, "Scale", ResourceType::Float),
            (3, "Enabled", ResourceType::Boolean),
            (4, "Blob", ResourceType::Opaque),
            (5, "Link", ResourceType::ObjectLink),
        ] {
            registry
                .register_resource(
                    20000,
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
    fn scalar_round_trips() {
        let registry = registry();

        for (id, text) in [
            (0u16, "Pacific/Auckland"),
            (1, "-9223372036854775808"),
            (2, "12.5"),
            (3, "1"),
            (5, "3:0"),
        ] {
            let node = decode_resource(&registry, 20000, id, text.as_bytes()).unwrap();
            assert_eq!(
                encode_resource(&node).unwrap().as_ref(),
                text.as_bytes(),
                "resource {id}"
            );
        }
    }

    #[test]
    fn float_accepts_fixed_and_scientific() {
        let registry = registry();

        for text in ["12.300000", "1.23e1", "-0.5"] {
            assert!(decode_resource(&registry, 20000, 2, text.as_bytes()).is_ok());
        }
    }

    #[test]
    fn opaque_rejected() {
        let registry = registry();

        assert!(matches!(
            decode_resource(&registry, 20000, 4, b"xx"),
            Err(Error::TypeMismatch)
        ));
    }

    #[test]
    fn malformed_rejected() {
        let registry = registry();

        assert!(decode_resource(&registry, 20000, 1, b"12a").is_err());
        assert!(decode_resource(&registry, 20000, 3, b"true").is_err());
        assert!(decode_resource(&registry, 20000, 5, b"3").is_err());
    }
}
