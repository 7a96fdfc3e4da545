use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;

use codec::{
    ContentFormat,
    coap::{Code, Message, MessageType},
    path::Path,
    registry::ResourceOperations,
    value::ResourceType,
};

use lwm2m_stack_service::{
    ClientOptions, ClientService, FactoryBootstrap, SecurityRecord, ServerRecord, ServiceHandler,
    transport::QueueTransport,
};

#[derive(Default, Clone)]
struct Handler;

impl ServiceHandler for Handler {}

fn server_peer() -> SocketAddr {
    "127.0.0.1:5683".parse().unwrap()
}

fn factory_client() -> ClientService<Handler> {
    ClientService::new(ClientOptions {
        endpoint_name: "imagination1".to_string(),
        bootstrap_uri: String::new(),
        bootstrap_hold_off: 0,
        factory: Some(FactoryBootstrap {
            security: SecurityRecord {
                server_uri: "coap://127.0.0.1:5683".to_string(),
                bootstrap: false,
                short_server_id: 1,
                hold_off_time: 0,
            },
            server: ServerRecord {
                short_server_id: 1,
                lifetime: 30,
                binding: "U".to_string(),
            },
        }),
        default_attributes: Default::default(),
        handler: Handler,
    })
    .unwrap()
}

fn request(code: Code, path: &str) -> Message {
    let mut message = Message::new(MessageType::Confirmable, code, rand::random::<u16>());
    message.set_token(&rand::random::<[u8; 4]>());
    message.set_uri_path(path);
    message
}

/// Dispatch one request and return the client's response.
fn exchange(
    client: &mut ClientService<Handler>,
    transport: &mut QueueTransport,
    message: Message,
    now: Instant,
) -> Message {
    client.handle_message(server_peer(), &message, now, transport);

    let mut sent = transport.take();
    assert!(!sent.is_empty(), "a response must be sent");

    let (peer, response) = sent.remove(0);
    assert_eq!(peer, server_peer());
    response
}

#[test]
fn read_manufacturer_as_plain_text() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.set_resource(
        &Path::resource(3, 0, 0),
        Bytes::from_static(b"Open Mobile Alliance"),
    )?;

    let mut message = request(Code::Get, "/3/0/0");
    message.set_accept(ContentFormat::PlainText.into());

    let response = exchange(&mut client, &mut transport, message, now);
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.payload.len(), 20);
    assert_eq!(response.payload.as_ref(), b"Open Mobile Alliance");

    Ok(())
}

#[test]
fn write_timezone_notifies_once() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.set_resource(&Path::resource(3, 0, 15), Bytes::from_static(b"UTC"))?;

    // Observe /3/0/15 with pmin=0, pmax=3600.
    let mut observe = request(Code::Get, "/3/0/15");
    observe.set_observe(0);
    observe.set_accept(ContentFormat::PlainText.into());

    let mut attributes = request(Code::Put, "/3/0/15");
    attributes.add_uri_query("pmin=0");
    attributes.add_uri_query("pmax=3600");
    let response = exchange(&mut client, &mut transport, attributes, now);
    assert_eq!(response.code, Code::Changed);

    let response = exchange(&mut client, &mut transport, observe, now);
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.observe(), Some(0));

    // Write a new value: 2.04 plus one notification carrying the payload.
    let mut write = request(Code::Put, "/3/0/15");
    write.set_content_format(ContentFormat::PlainText.into());
    write.set_payload(Bytes::from_static(b"Pacific/Auckland"));

    let later = now + Duration::from_secs(1);
    client.handle_message(server_peer(), &write, later, &mut transport);

    let sent = transport.take();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.code, Code::Changed);
    assert_eq!(sent[1].1.code, Code::Content);
    assert_eq!(sent[1].1.observe(), Some(1));
    assert_eq!(sent[1].1.payload.as_ref(), b"Pacific/Auckland");

    // An identical second write must not notify before pmax.
    let mut write = request(Code::Put, "/3/0/15");
    write.set_content_format(ContentFormat::PlainText.into());
    write.set_payload(Bytes::from_static(b"Pacific/Auckland"));

    let even_later = later + Duration::from_secs(1);
    client.handle_message(server_peer(), &write, even_later, &mut transport);

    let sent = transport.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.code, Code::Changed);

    Ok(())
}

#[test]
fn create_via_tlv_and_read_back() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.define_object("TestObject", 9999, 0, 10)?;
    client.define_resource(
        9999,
        1,
        "Counter",
        ResourceType::Integer,
        0,
        1,
        ResourceOperations::ReadWrite,
        None,
    )?;

    let mut create = request(Code::Post, "/9999");
    create.set_content_format(ContentFormat::Tlv.into());
    create.set_payload(Bytes::from_static(&[0x08, 0x00, 0x03, 0xC1, 0x01, 0x05]));

    let response = exchange(&mut client, &mut transport, create, now);
    assert_eq!(response.code, Code::Created);
    assert_eq!(response.location_path(), "/9999/0");

    let mut read = request(Code::Get, "/9999/0/1");
    read.set_accept(ContentFormat::Tlv.into());

    let response = exchange(&mut client, &mut transport, read, now);
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.payload.as_ref(), &[0xC1, 0x01, 0x05]);

    Ok(())
}

#[test]
fn bootstrap_then_register() -> Result<()> {
    let bootstrap_peer: SocketAddr = "127.0.0.1:15685".parse().unwrap();

    let mut client = ClientService::new(ClientOptions {
        endpoint_name: "imagination1".to_string(),
        bootstrap_uri: "coap://127.0.0.1:15685".to_string(),
        bootstrap_hold_off: 0,
        factory: None,
        default_attributes: Default::default(),
        handler: Handler,
    })
    .unwrap();

    let mut transport = QueueTransport::default();
    let mut now = Instant::now();

    // The machine holds off (zero seconds) and POSTs the bootstrap request.
    client.process(now, &mut transport);
    now += Duration::from_millis(10);
    client.process(now, &mut transport);

    let sent = transport.take();
    let bootstrap_request = sent
        .iter()
        .find(|(peer, _)| *peer == bootstrap_peer)
        .expect("bootstrap request must go out");

    assert_eq!(bootstrap_request.1.uri_path(), "/bs");
    assert_eq!(
        bootstrap_request.1.uri_query(),
        vec!["ep=imagination1".to_string()]
    );

    // The bootstrap server provisions Security and Server entries.
    let mut write = request(Code::Put, "/0/2");
    write.set_content_format(ContentFormat::Json.into());
    write.set_payload(Bytes::from_static(
        br#"{"bn":"/0/2/","e":[
            {"n":"0","sv":"coap://127.0.0.1:5683"},
            {"n":"1","bv":"false"},
            {"n":"10","v":1}
        ]}"#,
    ));

    client.handle_message(bootstrap_peer, &write, now, &mut transport);
    assert_eq!(transport.take().pop().unwrap().1.code, Code::Changed);

    let mut write = request(Code::Put, "/1/0");
    write.set_content_format(ContentFormat::Json.into());
    write.set_payload(Bytes::from_static(
        br#"{"bn":"/1/0/","e":[
            {"n":"0","v":1},
            {"n":"1","v":30},
            {"n":"7","sv":"U"}
        ]}"#,
    ));

    client.handle_message(bootstrap_peer, &write, now, &mut transport);
    assert_eq!(transport.take().pop().unwrap().1.code, Code::Changed);

    // Bootstrap finish, then the registration machine takes over.
    let finish = request(Code::Post, "/bs");
    client.handle_message(bootstrap_peer, &finish, now, &mut transport);
    assert_eq!(transport.take().pop().unwrap().1.code, Code::Changed);

    now += Duration::from_millis(10);
    client.process(now, &mut transport);
    now += Duration::from_millis(10);
    client.process(now, &mut transport);

    let sent = transport.take();
    let register = sent
        .iter()
        .find(|(_, message)| message.uri_path() == "/rd")
        .expect("register must go out");

    let register_peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
    assert_eq!(register.0, register_peer);

    let query = register.1.uri_query();
    assert!(query.contains(&"ep=imagination1".to_string()), "{query:?}");
    assert!(query.contains(&"lt=30".to_string()), "{query:?}");
    assert!(query.contains(&"b=U".to_string()), "{query:?}");

    let body = String::from_utf8(register.1.payload.to_vec())?;
    assert!(body.starts_with("</>;rt=\"oma.lwm2m\""), "{body}");
    assert!(body.contains("</3/0>"), "{body}");
    assert!(!body.contains("</0"), "security must not be advertised: {body}");

    // Acknowledge with 2.01 + Location; the machine lands in Registered.
    let mut ack = Message::response(&register.1, Code::Created);
    ack.set_location_path("/rd/0");
    client.handle_message(register_peer, &ack, now, &mut transport);

    // A refresh is due at half the lifetime.
    now += Duration::from_secs(16);
    client.process(now, &mut transport);

    let sent = transport.take();
    let update = sent
        .iter()
        .find(|(_, message)| message.uri_path() == "/rd/0")
        .expect("update must go out");

    assert!(
        update.1.uri_query().contains(&"lt=30".to_string()),
        "{:?}",
        update.1.uri_query()
    );

    // The object list did not change, so the body stays home.
    assert!(update.1.payload.is_empty());

    Ok(())
}

#[test]
fn discover_device_object() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.set_resource(&Path::resource(3, 0, 0), Bytes::from_static(b"Imagination"))?;
    client.set_resource(&Path::resource(3, 0, 1), Bytes::from_static(b"Ci40"))?;

    let mut discover = request(Code::Get, "/3");
    discover.set_accept(ContentFormat::LinkFormat.into());

    let response = exchange(&mut client, &mut transport, discover, now);
    assert_eq!(response.code, Code::Content);
    assert_eq!(
        response.content_format(),
        Some(ContentFormat::LinkFormat.into())
    );

    let body = String::from_utf8(response.payload.to_vec())?;
    for expected in ["</3/0>", "</3/0/0>", "</3/0/1>"] {
        assert!(body.contains(expected), "{body}");
    }

    Ok(())
}

#[test]
fn json_write_then_read_back() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.define_object("Test", 10000, 0, 10)?;
    client.define_resource(
        10000,
        2,
        "Value",
        ResourceType::Integer,
        0,
        1,
        ResourceOperations::ReadWrite,
        None,
    )?;
    client.create_object_instance(10000, Some(0))?;

    let mut write = request(Code::Put, "/10000/0/2");
    write.set_content_format(ContentFormat::Json.into());
    write.set_payload(Bytes::from_static(
        br#"{"bn":"/10000/0/","e":[{"n":"2","v":123456789}]}"#,
    ));

    let response = exchange(&mut client, &mut transport, write, now);
    assert_eq!(response.code, Code::Changed);

    let mut read = request(Code::Get, "/10000/0/2");
    read.set_accept(ContentFormat::Json.into());

    let response = exchange(&mut client, &mut transport, read, now);
    assert_eq!(response.code, Code::Content);

    let body = String::from_utf8(response.payload.to_vec())?;
    assert!(body.contains("\"v\":123456789"), "{body}");
    assert!(body.contains("\"bn\":\"/10000/0/2"), "{body}");

    Ok(())
}

#[test]
fn method_and_permission_errors() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    // Unknown object.
    let response = exchange(&mut client, &mut transport, request(Code::Get, "/42"), now);
    assert_eq!(response.code, Code::NotFound);

    // Malformed path.
    let response = exchange(
        &mut client,
        &mut transport,
        request(Code::Get, "/3/0/15/1/9"),
        now,
    );
    assert_eq!(response.code, Code::NotFound);

    // Writing a read-only resource.
    let mut write = request(Code::Put, "/3/0/0");
    write.set_content_format(ContentFormat::PlainText.into());
    write.set_payload(Bytes::from_static(b"nope"));
    let response = exchange(&mut client, &mut transport, write, now);
    assert_eq!(response.code, Code::MethodNotAllowed);

    // Unsupported content format on a write.
    let mut write = request(Code::Put, "/3/0/15");
    write.set_content_format(9999);
    write.set_payload(Bytes::from_static(b"x"));
    let response = exchange(&mut client, &mut transport, write, now);
    assert_eq!(response.code, Code::UnsupportedContentFormat);

    // Deleting the mandatory Device instance.
    let response = exchange(
        &mut client,
        &mut transport,
        request(Code::Delete, "/3/0"),
        now,
    );
    assert_eq!(response.code, Code::MethodNotAllowed);

    // Executing a non-executable resource.
    let response = exchange(
        &mut client,
        &mut transport,
        request(Code::Post, "/3/0/4"),
        now,
    );
    assert_eq!(response.code, Code::Changed);

    Ok(())
}

#[test]
fn pmax_forces_unchanged_notification() -> Result<()> {
    let mut client = factory_client();
    let mut transport = QueueTransport::default();
    let now = Instant::now();

    client.set_resource(&Path::resource(3, 0, 15), Bytes::from_static(b"UTC"))?;

    let mut attributes = request(Code::Put, "/3/0/15");
    attributes.add_uri_query("pmax=10");
    exchange(&mut client, &mut transport, attributes, now);

    let mut observe = request(Code::Get, "/3/0/15");
    observe.set_observe(0);
    observe.set_accept(ContentFormat::PlainText.into());
    exchange(&mut client, &mut transport, observe, now);

    // Nothing changed, but pmax lapsed: the scan emits anyway.
    client.process(now + Duration::from_secs(11), &mut transport);

    let sent = transport.take();
    let notification = sent
        .iter()
        .find(|(_, message)| message.observe().is_some())
        .expect("pmax must force a notification");

    assert_eq!(notification.1.payload.as_ref(), b"UTC");
    assert_eq!(notification.1.observe(), Some(1));

    Ok(())
}
