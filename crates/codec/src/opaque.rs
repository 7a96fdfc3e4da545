//! Raw octet payloads, for singleton Opaque resources only.

use bytes::Bytes;

use crate::{
    Error,
    node::{Node, NodeKind},
    registry::DefinitionRegistry,
    value::ResourceType,
};

pub fn encode_resource(node: &Node) -> Result<Bytes, Error> {
    if node.resource_type() != Some(ResourceType::Opaque) {
        return Err(Error::CodecNotFound);
    }

    match node.value() {
        Some(value) => Ok(value.clone()),
        None => Ok(node
            .first_child()
            .and_then(|it| it.value())
            .ok_or(Error::NotFound)?
            .clone()),
    }
}

pub fn decode_resource(
    registry: &DefinitionRegistry,
    object_id: u16,
    resource_id: u16,
    bytes: &[u8],
) -> Result<Node, Error> {
    let definition = registry
        .lookup_resource(object_id, resource_id)
        .ok_or(Error::NotDefined)?;

    if definition.resource_type != ResourceType::Opaque {
        return Err(Error::CodecNotFound);
    }

    let mut resource = Node::new(NodeKind::Resource, Some(resource_id));
    resource.set_resource_type(ResourceType::Opaque);
    resource.add_child(Node::with_value(
        NodeKind::ResourceInstance,
        Some(0),
        Bytes::copy_from_slice(bytes),
    ));

    Ok(resource)
}
