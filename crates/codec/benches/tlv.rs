use criterion::{Criterion, criterion_group, criterion_main};

use lwm2m_stack_codec::{
    node::{Node, NodeKind},
    registry::{DefinitionRegistry, ResourceOperations},
    tlv,
    value::{ResourceType, encode_integer},
};

fn registry() -> DefinitionRegistry {
    let mut registry = DefinitionRegistry::new();
    registry.register_object("Bench", 30000, 0, 10).unwrap();
    registry
        .register_resource(
            30000,
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
            30000,
            1,
            "Readings",
            ResourceType::IntegerArray,
            0,
            100,
            ResourceOperations::ReadWrite,
            None,
        )
        .unwrap();

    registry
}

fn instance() -> Node {
    let mut instance = Node::new(NodeKind::ObjectInstance, Some(0));

    let label = instance.add_child(Node::new(NodeKind::Resource, Some(0)));
    label.set_resource_type(ResourceType::String);
    label.add_child(Node::with_value(
        NodeKind::ResourceInstance,
        Some(0),
        b"benchmark".as_slice().into(),
    ));

    let readings = instance.add_child(Node::new(NodeKind::Resource, Some(1)));
    readings.set_resource_type(ResourceType::IntegerArray);
    for id in 0..100u16 {
        readings.add_child(Node::with_value(
            NodeKind::ResourceInstance,
            Some(id),
            encode_integer(id as i64 * 1000),
        ));
    }

    instance
}

fn criterion_benchmark(c: &mut Criterion) {
    let registry = registry();
    let instance = instance();
    let bytes = tlv::encode_object_instance(&instance).unwrap();

    c.bench_function("tlv_encode_object_instance", |b| {
        b.iter(|| tlv::encode_object_instance(&instance).unwrap())
    });

    c.bench_function("tlv_decode_object_instance", |b| {
        b.iter(|| tlv::decode_object_instance(&registry, 30000, 0, &bytes).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
