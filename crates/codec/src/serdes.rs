//! Codec selection: `(content format, request level) -> codec`.
//!
//! Not every codec serves every level; combinations without a codec fail
//! with [`Error::CodecNotFound`] so the dispatcher can answer 4.15.

use bytes::Bytes;

use crate::{
    ContentFormat, Error, node::Node, opaque, path::Path, registry::DefinitionRegistry, senml,
    text, tlv,
};

/// Serialize `node` for the level addressed by `path`.
///
/// `basetime` only affects the JSON codec's Time handling.
pub fn encode(
    format: ContentFormat,
    node: &Node,
    path: &Path,
    basetime: Option<i64>,
) -> Result<Bytes, Error> {
    match (format, path.depth()) {
        (ContentFormat::Tlv, 1) => tlv::encode_object(node),
        (ContentFormat::Tlv, 2) => tlv::encode_object_instance(node),
        (ContentFormat::Tlv, 3) => tlv::encode_resource(node),
        (ContentFormat::Json, 1) => senml::encode_object(node, path.object_id(), basetime),
        (ContentFormat::Json, 2) => senml::encode_object_instance(
            node,
            path.object_id(),
            path.object_instance_id().unwrap_or_default(),
            basetime,
        ),
        (ContentFormat::Json, 3) => senml::encode_resource(
            node,
            path.object_id(),
            path.object_instance_id().unwrap_or_default(),
            path.resource_id().unwrap_or_default(),
            basetime,
        ),
        (ContentFormat::PlainText, 3) => text::encode_resource(node),
        (ContentFormat::Opaque, 3) => opaque::encode_resource(node),
        _ => Err(Error::CodecNotFound),
    }
}

/// Parse `bytes` into a detached tree rooted at the level `path` addresses.
pub fn decode(
    format: ContentFormat,
    registry: &DefinitionRegistry,
    path: &Path,
    bytes: &[u8],
) -> Result<Node, Error> {
    match (format, path.depth()) {
        (ContentFormat::Tlv, 1) => tlv::decode_object(registry, path.object_id(), bytes),
        (ContentFormat::Tlv, 2) => tlv::decode_object_instance(
            registry,
            path.object_id(),
            path.object_instance_id().unwrap_or_default(),
            bytes,
        ),
        (ContentFormat::Tlv, 3) => tlv::decode_resource(
            registry,
            path.object_id(),
            path.resource_id().unwrap_or_default(),
            bytes,
        ),
        (ContentFormat::Json, 1..=3) => senml::decode(registry, path, bytes),
        (ContentFormat::PlainText, 3) => text::decode_resource(
            registry,
            path.object_id(),
            path.resource_id().unwrap_or_default(),
            bytes,
        ),
        (ContentFormat::Opaque, 3) => opaque::decode_resource(
            registry,
            path.object_id(),
            path.resource_id().unwrap_or_default(),
            bytes,
        ),
        _ => Err(Error::CodecNotFound),
    }
}
