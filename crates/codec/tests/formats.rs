use lwm2m_stack_codec::{
    ContentFormat,
    node::{Node, NodeKind},
    path::Path,
    registry::{DefinitionRegistry, ResourceOperations},
    serdes,
    value::{ResourceType, decode_integer, encode_integer},
};

fn registry() -> DefinitionRegistry {
    let mut registry = DefinitionRegistry::new();
    registry.register_object("Device", 3, 1, 1).unwrap();
    registry
        .register_resource(
            3,
            0,
            "Manufacturer",
            ResourceType::String,
            0,
            1,
            ResourceOperations::Read,
            None,
        )
        .unwrap();
    registry
        .register_resource(
            3,
            15,
            "Timezone",
            ResourceType::String,
            0,
            1,
            ResourceOperations::ReadWrite,
            None,
        )
        .unwrap();

    registry.register_object("Test", 9999, 0, 10).unwrap();
    registry
        .register_resource(
            9999,
            1,
            "Counter",
            ResourceType::Integer,
            0,
            1,
            ResourceOperations::ReadWrite,
            None,
        )
        .unwrap();

    registry
}

fn integer_resource(value: i64) -> Node {
    let mut resource = Node::new(NodeKind::Resource, Some(1));
    resource.set_resource_type(ResourceType::Integer);
    resource.add_child(Node::with_value(
        NodeKind::ResourceInstance,
        Some(0),
        encode_integer(value),
    ));

    resource
}

#[test]
fn tlv_integer_boundaries_round_trip() {
    let registry = registry();
    let path = Path::resource(9999, 0, 1);

    for value in [
        0,
        -1,
        127,
        -128,
        32767,
        -32768,
        i64::from(i32::MAX),
        i64::from(i32::MIN),
        i64::MAX,
        i64::MIN,
    ] {
        let resource = integer_resource(value);
        let bytes = serdes::encode(ContentFormat::Tlv, &resource, &path, None).unwrap();
        let decoded = serdes::decode(ContentFormat::Tlv, &registry, &path, &bytes).unwrap();

        assert_eq!(
            decode_integer(decoded.child(0).unwrap().value().unwrap()).unwrap(),
            value,
        );

        // Canonical encoding: a second pass over the decoded tree emits the
        // same bytes.
        assert_eq!(
            serdes::encode(ContentFormat::Tlv, &decoded, &path, None).unwrap(),
            bytes,
        );
    }
}

#[test]
fn create_payload_decodes_and_reencodes() {
    let registry = registry();
    let path = Path::object(9999);

    let buffer = [0x08, 0x00, 0x03, 0xC1, 0x01, 0x05];
    let object = serdes::decode(ContentFormat::Tlv, &registry, &path, &buffer).unwrap();

    let instance = object.child(0).unwrap();
    assert_eq!(
        instance.child(1).unwrap().child(0).unwrap().value().unwrap().as_ref(),
        &[0x05],
    );

    assert_eq!(
        serdes::encode(ContentFormat::Tlv, &object, &path, None)
            .unwrap()
            .as_ref(),
        &buffer,
    );
}

#[test]
fn json_read_after_write_preserves_value() {
    let registry = registry();
    let path = Path::resource(9999, 0, 1);

    let body = br#"{"bn":"/9999/0/","e":[{"n":"1","v":123456789}]}"#;
    let tree = serdes::decode(
        ContentFormat::Json,
        &registry,
        &Path::object_instance(9999, 0),
        body,
    )
    .unwrap();

    let resource = tree.child(1).unwrap();
    let bytes = serdes::encode(ContentFormat::Json, resource, &path, None).unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();

    assert!(text.contains("\"v\":123456789"), "{text}");
    assert!(text.contains("\"bn\":\"/9999/0/1/\""), "{text}");

    let again = serdes::decode(ContentFormat::Json, &registry, &path, &bytes).unwrap();
    assert_eq!(
        decode_integer(again.child(0).unwrap().value().unwrap()).unwrap(),
        123456789,
    );
}

#[test]
fn plain_text_string_has_no_terminator() {
    let registry = registry();
    let path = Path::resource(3, 0, 0);

    let mut resource = Node::new(NodeKind::Resource, Some(0));
    resource.set_resource_type(ResourceType::String);
    resource.add_child(Node::with_value(
        NodeKind::ResourceInstance,
        Some(0),
        b"Open Mobile Alliance".as_slice().into(),
    ));

    let bytes = serdes::encode(ContentFormat::PlainText, &resource, &path, None).unwrap();
    assert_eq!(bytes.len(), 20);
    assert_eq!(bytes.as_ref(), b"Open Mobile Alliance");
}

#[test]
fn unsupported_level_is_codec_not_found() {
    let registry = registry();

    assert!(
        serdes::decode(
            ContentFormat::PlainText,
            &registry,
            &Path::object(3),
            b"x",
        )
        .is_err()
    );

    let object = Node::new(NodeKind::Object, Some(3));
    assert!(
        serdes::encode(ContentFormat::Opaque, &object, &Path::object(3), None).is_err()
    );
}

#[test]
fn legacy_media_types_translate() {
    for (alias, canonical) in [
        (11542u16, ContentFormat::Tlv),
        (11543, ContentFormat::Json),
        (1541, ContentFormat::PlainText),
        (1544, ContentFormat::Opaque),
        (50, ContentFormat::Json),
    ] {
        assert_eq!(ContentFormat::from_media_type(alias), Some(canonical));
    }
}
