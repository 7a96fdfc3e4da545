//! OMA TLV, the binary LwM2M content format.
//!
//! Each entry is `type-byte | id | length | value`. The top two bits of the
//! type byte select the entry kind, bit 5 selects an 8- or 16-bit id, bits
//! 4-3 select the width of the length field (zero meaning the length lives
//! in the low three bits), and nesting expresses the hierarchy: an object
//! payload is a run of object-instance entries, a multiple resource wraps
//! its resource-instance entries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Error,
    node::{Node, NodeKind},
    registry::{DefinitionRegistry, ResourceDefinition},
    value::{ResourceType, decode_integer, encode_integer},
};

const KIND_OBJECT_INSTANCE: u8 = 0b00;
const KIND_RESOURCE_INSTANCE: u8 = 0b01;
const KIND_MULTIPLE_RESOURCE: u8 = 0b10;
const KIND_RESOURCE_VALUE: u8 = 0b11;

/// Append one TLV entry.
///
/// Container kinds always carry a separate length field so their headers
/// stay stable as children grow; leaf kinds inline lengths up to 7 bytes.
fn put_entry(bytes: &mut BytesMut, kind: u8, id: u16, value: &[u8]) {
    let inline = matches!(kind, KIND_RESOURCE_VALUE | KIND_RESOURCE_INSTANCE) && value.len() <= 7;

    let mut type_byte = kind << 6;
    if id > 0xFF {
        type_byte |= 0b0010_0000;
    }

    if inline {
        type_byte |= value.len() as u8;
    } else if value.len() <= 0xFF {
        type_byte |= 0b0000_1000;
    } else if value.len() <= 0xFFFF {
        type_byte |= 0b0001_0000;
    } else {
        type_byte |= 0b0001_1000;
    }

    bytes.put_u8(type_byte);

    if id > 0xFF {
        bytes.put_u16(id);
    } else {
        bytes.put_u8(id as u8);
    }

    if !inline {
        if value.len() <= 0xFF {
            bytes.put_u8(value.len() as u8);
        } else if value.len() <= 0xFFFF {
            bytes.put_u16(value.len() as u16);
        } else {
            bytes.put_u8((value.len() >> 16) as u8);
            bytes.put_u16(value.len() as u16);
        }
    }

    bytes.put(value);
}

struct Entry<'a> {
    kind: u8,
    id: u16,
    value: &'a [u8],
}

/// Split one entry off the front of `bytes`.
fn take_entry<'a>(bytes: &'a [u8]) -> Result<(Entry<'a>, &'a [u8]), Error> {
    if bytes.is_empty() {
        return Err(Error::DecodeError);
    }

    let type_byte = bytes[0];
    let kind = type_byte >> 6;
    let wide_id = type_byte & 0b0010_0000 != 0;
    let length_width = (type_byte >> 3) & 0b11;

    let mut offset = 1;
    let id = if wide_id {
        if bytes.len() < offset + 2 {
            return Err(Error::DecodeError);
        }

        let id = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        offset += 2;
        id
    } else {
        if bytes.len() < offset + 1 {
            return Err(Error::DecodeError);
        }

        let id = bytes[offset] as u16;
        offset += 1;
        id
    };

    let length = if length_width == 0 {
        (type_byte & 0b111) as usize
    } else {
        let width = length_width as usize;
        if bytes.len() < offset + width {
            return Err(Error::DecodeError);
        }

        let mut length = 0usize;
        for byte in &bytes[offset..offset + width] {
            length = (length << 8) | *byte as usize;
        }

        offset += width;
        length
    };

    if bytes.len() < offset + length {
        return Err(Error::DecodeError);
    }

    Ok((
        Entry {
            kind,
            id,
            value: &bytes[offset..offset + length],
        },
        &bytes[offset + length..],
    ))
}

/// Integers re-encode at the smallest width that preserves the value, so
/// encoding is canonical no matter what width the value arrived in.
fn canonical_value(resource_type: Option<ResourceType>, value: &Bytes) -> Bytes {
    if let Some(resource_type) = resource_type {
        if matches!(
            resource_type.scalar(),
            ResourceType::Integer | ResourceType::Time
        ) {
            if let Ok(decoded) = decode_integer(value) {
                return encode_integer(decoded);
            }
        }
    }

    value.clone()
}

fn put_resource(bytes: &mut BytesMut, node: &Node) -> Result<(), Error> {
    let id = node.id().ok_or(Error::DecodeError)?;

    let multiple = node.resource_type().map(|it| it.is_array()).unwrap_or(false);
    if multiple {
        let mut nested = BytesMut::new();
        for instance in node.children() {
            let value = canonical_value(
                node.resource_type(),
                instance.value().ok_or(Error::DecodeError)?,
            );

            put_entry(
                &mut nested,
                KIND_RESOURCE_INSTANCE,
                instance.id().ok_or(Error::DecodeError)?,
                &value,
            );
        }

        put_entry(bytes, KIND_MULTIPLE_RESOURCE, id, &nested);
    } else {
        // A singleton carries its value on the synthetic instance 0 when it
        // came out of the store, or directly on the resource node.
        let value = match node.value() {
            Some(value) => value.clone(),
            None => node
                .first_child()
                .and_then(|it| it.value())
                .ok_or(Error::DecodeError)?
                .clone(),
        };

        put_entry(
            bytes,
            KIND_RESOURCE_VALUE,
            id,
            &canonical_value(node.resource_type(), &value),
        );
    }

    Ok(())
}

fn put_object_instance(bytes: &mut BytesMut, node: &Node) -> Result<(), Error> {
    let mut nested = BytesMut::new();
    for resource in node.children() {
        put_resource(&mut nested, resource)?;
    }

    put_entry(
        bytes,
        KIND_OBJECT_INSTANCE,
        node.id().ok_or(Error::DecodeError)?,
        &nested,
    );

    Ok(())
}

/// Serialize a whole object: one object-instance entry per instance.
pub fn encode_object(node: &Node) -> Result<Bytes, Error> {
    let mut bytes = BytesMut::new();
    for instance in node.children() {
        put_object_instance(&mut bytes, instance)?;
    }

    Ok(bytes.freeze())
}

/// Serialize one object instance: its resource entries, no wrapper.
pub fn encode_object_instance(node: &Node) -> Result<Bytes, Error> {
    let mut bytes = BytesMut::new();
    for resource in node.children() {
        put_resource(&mut bytes, resource)?;
    }

    Ok(bytes.freeze())
}

/// Serialize one resource entry.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::node::{Node, NodeKind};
/// use lwm2m_stack_codec::value::ResourceType;
/// use lwm2m_stack_codec::tlv;
///
/// let mut resource = Node::new(NodeKind::Resource, Some(1));
/// resource.set_resource_type(ResourceType::Integer);
/// resource.add_child(Node::with_value(
///     NodeKind::ResourceInstance,
///     Some(0),
///     vec![0x05].into(),
/// ));
///
/// assert_eq!(tlv::encode_resource(&resource).unwrap().as_ref(), &[0xC1, 0x01, 0x05]);
/// ```
pub fn encode_resource(node: &Node) -> Result<Bytes, Error> {
    let mut bytes = BytesMut::new();
    put_resource(&mut bytes, node)?;
    Ok(bytes.freeze())
}

fn check_value(definition: &ResourceDefinition, value: &[u8]) -> Result<(), Error> {
    definition.resource_type.check_width(value.len())
}

fn decode_resource_entry(
    registry: &DefinitionRegistry,
    object_id: u16,
    entry: &Entry,
) -> Result<Node, Error> {
    let definition = registry
        .lookup_resource(object_id, entry.id)
        .ok_or(Error::NotDefined)?;

    let mut resource = Node::new(NodeKind::Resource, Some(entry.id));
    resource.set_resource_type(definition.resource_type);

    match entry.kind {
        KIND_RESOURCE_VALUE => {
            if definition.multiple() {
                return Err(Error::TypeMismatch);
            }

            check_value(definition, entry.value)?;
            resource.add_child(Node::with_value(
                NodeKind::ResourceInstance,
                Some(0),
                Bytes::copy_from_slice(entry.value),
            ));
        }
        KIND_MULTIPLE_RESOURCE => {
            if !definition.multiple() {
                return Err(Error::TypeMismatch);
            }

            let mut rest = entry.value;
            while !rest.is_empty() {
                let (nested, remaining) = take_entry(rest)?;
                if nested.kind != KIND_RESOURCE_INSTANCE {
                    return Err(Error::DecodeError);
                }

                check_value(definition, nested.value)?;
                resource.add_child(Node::with_value(
                    NodeKind::ResourceInstance,
                    Some(nested.id),
                    Bytes::copy_from_slice(nested.value),
                ));

                rest = remaining;
            }
        }
        _ => return Err(Error::DecodeError),
    }

    Ok(resource)
}

fn decode_instance_body(
    registry: &DefinitionRegistry,
    object_id: u16,
    instance_id: Option<u16>,
    bytes: &[u8],
) -> Result<Node, Error> {
    let mut instance = Node::new(NodeKind::ObjectInstance, instance_id);

    let mut rest = bytes;
    while !rest.is_empty() {
        let (entry, remaining) = take_entry(rest)?;
        instance.add_child(decode_resource_entry(registry, object_id, &entry)?);
        rest = remaining;
    }

    Ok(instance)
}

/// Parse an object-level payload.
///
/// A run of object-instance entries produces one child per instance. A
/// payload of bare resource entries is accepted as a single anonymous
/// instance, which is how Create requests arrive when the server leaves id
/// assignment to the client.
pub fn decode_object(
    registry: &DefinitionRegistry,
    object_id: u16,
    bytes: &[u8],
) -> Result<Node, Error> {
    registry.lookup_object(object_id).ok_or(Error::NotDefined)?;

    let mut object = Node::new(NodeKind::Object, Some(object_id));
    if bytes.is_empty() {
        return Ok(object);
    }

    if bytes[0] >> 6 != KIND_OBJECT_INSTANCE {
        object.add_child(decode_instance_body(registry, object_id, None, bytes)?);
        return Ok(object);
    }

    let mut rest = bytes;
    while !rest.is_empty() {
        let (entry, remaining) = take_entry(rest)?;
        if entry.kind != KIND_OBJECT_INSTANCE {
            return Err(Error::DecodeError);
        }

        object.add_child(decode_instance_body(
            registry,
            object_id,
            Some(entry.id),
            entry.value,
        )?);

        rest = remaining;
    }

    Ok(object)
}

/// Parse an instance-level payload: resource entries, or a single
/// object-instance wrapper whose id must match the request.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::registry::{DefinitionRegistry, ResourceOperations};
/// use lwm2m_stack_codec::value::ResourceType;
/// use lwm2m_stack_codec::tlv;
///
/// let mut registry = DefinitionRegistry::new();
/// registry.register_object("Test", 9999, 0, 10).unwrap();
/// registry
///     .register_resource(9999, 1, "Counter", ResourceType::Integer, 0, 1,
///                        ResourceOperations::ReadWrite, None)
///     .unwrap();
///
/// let buffer = [0x08, 0x00, 0x03, 0xC1, 0x01, 0x05];
/// let object = tlv::decode_object(&registry, 9999, &buffer).unwrap();
///
/// let instance = object.child(0).unwrap();
/// let value = instance.child(1).unwrap().child(0).unwrap().value().unwrap();
///
/// assert_eq!(value.as_ref(), &[0x05]);
/// assert_eq!(tlv::encode_object(&object).unwrap().as_ref(), &buffer);
/// ```
pub fn decode_object_instance(
    registry: &DefinitionRegistry,
    object_id: u16,
    instance_id: u16,
    bytes: &[u8],
) -> Result<Node, Error> {
    registry.lookup_object(object_id).ok_or(Error::NotDefined)?;

    if !bytes.is_empty() && bytes[0] >> 6 == KIND_OBJECT_INSTANCE {
        let (entry, rest) = take_entry(bytes)?;
        if !rest.is_empty() || entry.id != instance_id {
            return Err(Error::PathInvalid);
        }

        return decode_instance_body(registry, object_id, Some(instance_id), entry.value);
    }

    decode_instance_body(registry, object_id, Some(instance_id), bytes)
}

/// Parse a resource-level payload: one resource entry whose id must match
/// the request, or bare resource-instance entries for a multiple resource.
pub fn decode_resource(
    registry: &DefinitionRegistry,
    object_id: u16,
    resource_id: u16,
    bytes: &[u8],
) -> Result<Node, Error> {
    let definition = registry
        .lookup_resource(object_id, resource_id)
        .ok_or(Error::NotDefined)?;

    if !bytes.is_empty() && bytes[0] >> 6 == KIND_RESOURCE_INSTANCE {
        let mut resource = Node::new(NodeKind::Resource, Some(resource_id));
        resource.set_resource_type(definition.resource_type);

        if !definition.multiple() {
            return Err(Error::TypeMismatch);
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let (entry, remaining) = take_entry(rest)?;
            if entry.kind != KIND_RESOURCE_INSTANCE {
                return Err(Error::DecodeError);
            }

            check_value(definition, entry.value)?;
            resource.add_child(Node::with_value(
                NodeKind::ResourceInstance,
                Some(entry.id),
                Bytes::copy_from_slice(entry.value),
            ));

            rest = remaining;
        }

        return Ok(resource);
    }

    let (entry, rest) = take_entry(bytes)?;
    if !rest.is_empty() {
        return Err(Error::DecodeError);
    }

    if entry.id != resource_id {
        return Err(Error::PathInvalid);
    }

    decode_resource_entry(registry, object_id, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceOperations;

    fn registry() -> DefinitionRegistry {
        let mut registry = DefinitionRegistry::new();
        registry.register_object("Test", 4000, 0, 10).unwrap();
        registry
            .register_resource(
                4000,
                0,
                "Label",
                ResourceType::String,
                0,
                1,
                ResourceOperations::ReadWrite,
                None,
            )
            .unwrap();
        registry
            .register_resource(
                4000,
                1,
                "Readings",
                ResourceType::IntegerArray,
                0,
                10,
                ResourceOperations::ReadWrite,
                None,
            )
            .unwrap();

        registry
    }

    #[test]
    fn multiple_resource_round_trip() {
        let registry = registry();

        let mut resource = Node::new(NodeKind::Resource, Some(1));
        resource.set_resource_type(ResourceType::IntegerArray);
        resource.add_child(Node::with_value(
            NodeKind::ResourceInstance,
            Some(0),
            encode_integer(10),
        ));
        resource.add_child(Node::with_value(
            NodeKind::ResourceInstance,
            Some(5),
            encode_integer(-300),
        ));

        let bytes = encode_resource(&resource).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x88, 0x01, 0x07, 0x41, 0x00, 0x0A, 0x42, 0x05, 0xFE, 0xD4]
        );

        let decoded = decode_resource(&registry, 4000, 1, &bytes).unwrap();
        assert_eq!(decoded.children().count(), 2);
        assert_eq!(encode_resource(&decoded).unwrap(), bytes);
    }

    #[test]
    fn wide_id_and_length() {
        let registry = {
            let mut registry = DefinitionRegistry::new();
            registry.register_object("Test", 4000, 0, 1).unwrap();
            registry
                .register_resource(
                    4000,
                    300,
                    "Blob",
                    ResourceType::Opaque,
                    0,
                    1,
                    ResourceOperations::ReadWrite,
                    None,
                )
                .unwrap();
            registry
        };

        let mut resource = Node::new(NodeKind::Resource, Some(300));
        resource.set_resource_type(ResourceType::Opaque);
        resource.add_child(Node::with_value(
            NodeKind::ResourceInstance,
            Some(0),
            Bytes::from(vec![0xAB; 300]),
        ));

        let bytes = encode_resource(&resource).unwrap();
        // 16-bit id flag + 16-bit length field.
        assert_eq!(&bytes[..5], &[0xF0, 0x01, 0x2C, 0x01, 0x2C]);

        let decoded = decode_resource(&registry, 4000, 300, &bytes).unwrap();
        assert_eq!(
            decoded.child(0).unwrap().value().unwrap().len(),
            300
        );
    }

    #[test]
    fn integer_width_is_canonicalized() {
        // Value 5 arriving as a 2-byte integer re-encodes as 1 byte.
        let mut resource = Node::new(NodeKind::Resource, Some(1));
        resource.set_resource_type(ResourceType::IntegerArray);
        resource.add_child(Node::with_value(
            NodeKind::ResourceInstance,
            Some(0),
            Bytes::from(vec![0x00, 0x05]),
        ));

        let bytes = encode_resource(&resource).unwrap();
        assert_eq!(bytes.as_ref(), &[0x88, 0x01, 0x03, 0x41, 0x00, 0x05]);
    }

    #[test]
    fn type_conflicts_rejected() {
        let registry = registry();

        // Multiple entry against a singleton definition.
        let buffer = [0x83, 0x00, 0x41, 0x00, 0x05];
        assert!(matches!(
            decode_resource(&registry, 4000, 0, &buffer),
            Err(Error::TypeMismatch)
        ));

        // Unknown resource id.
        let buffer = [0xC1, 0x63, 0x05];
        assert!(matches!(
            decode_resource(&registry, 4000, 99, &buffer),
            Err(Error::NotDefined)
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let registry = registry();

        assert!(matches!(
            decode_object_instance(&registry, 4000, 0, &[0xC8, 0x00, 0x20, 0x41]),
            Err(Error::DecodeError)
        ));
    }
}
