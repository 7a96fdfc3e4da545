//! The client session: one LwM2M endpoint and everything it owns.
//!
//! The host pushes received CoAP messages into [`ClientService::handle_message`],
//! calls [`ClientService::process`] whenever the previous timeout hint
//! expires, and provides a [`Transport`] for everything outbound. Nothing
//! here blocks; suspension only ever happens in the host's socket loop.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use codec::{
    ContentFormat,
    coap::{Code, Message},
    link::{Link, serialise},
    node::Node,
    path::Path,
    registry::{DefinitionRegistry, ResourceOperations},
    serdes,
    value::ResourceType,
};

use crate::{
    Error, FactoryBootstrap, ServiceHandler,
    attributes::{AttributeStore, NotificationAttributes, ObserverSet},
    bootstrap::{BootstrapMachine, BootstrapState},
    endpoints::{EndpointKind, EndpointTable, Operation, error_code, operation_for},
    notify,
    objects::{self, device, security, server},
    registration::{RegistrationEvent, RegistrationMachine, machines_from_store},
    store::{ObjectStore, Origin, WriteMode},
    transport::Transport,
};

/// The fallback `process` interval when nothing is scheduled sooner.
const IDLE_TICK: Duration = Duration::from_secs(30);

pub struct ClientOptions<T> {
    /// The client's globally unique identity on the LwM2M network.
    pub endpoint_name: String,
    /// Bootstrap server URI; the empty string means factory-only.
    pub bootstrap_uri: String,
    /// Seconds to wait before contacting the bootstrap server.
    pub bootstrap_hold_off: u32,
    /// Factory-provisioned Security/Server records, if any.
    pub factory: Option<FactoryBootstrap>,
    /// Session-wide notification attribute defaults.
    pub default_attributes: NotificationAttributes,
    pub handler: T,
}

pub struct ClientService<T> {
    registry: DefinitionRegistry,
    store: ObjectStore,
    attributes: AttributeStore,
    observers: ObserverSet,
    endpoints: EndpointTable,
    bootstrap: BootstrapMachine,
    registrations: Vec<RegistrationMachine>,
    registrations_built: bool,
    bootstrap_reported: Option<BootstrapState>,
    endpoint_name: String,
    handler: T,
}

impl<T: ServiceHandler> ClientService<T> {
    pub fn new(options: ClientOptions<T>) -> Result<Self, Error> {
        let mut registry = DefinitionRegistry::new();
        objects::register_standard_objects(&mut registry)?;

        let mut endpoints = EndpointTable::default();
        endpoints.insert("/bs", EndpointKind::BootstrapFinish);
        for object in registry.objects() {
            endpoints.insert(format!("/{}", object.id), EndpointKind::Object);
        }

        let mut store = ObjectStore::new();

        // The Device object is a mandatory singleton.
        store.create_object_instance(&registry, Origin::Client, device::OBJECT_ID, Some(0))?;
        store.set_resource_instance(
            &registry,
            Origin::Client,
            device::OBJECT_ID,
            0,
            device::SUPPORTED_BINDINGS,
            0,
            Bytes::from_static(b"U"),
        )?;
        store.set_resource_instance(
            &registry,
            Origin::Client,
            device::OBJECT_ID,
            0,
            device::ERROR_CODE,
            0,
            Bytes::from_static(&[0]),
        )?;

        let bootstrap = if let Some(factory) = &options.factory {
            apply_factory_bootstrap(&mut store, &registry, factory)?;
            BootstrapMachine::new_bootstrapped(&options.endpoint_name)
        } else {
            BootstrapMachine::new(&options.endpoint_name)
        };

        if !options.bootstrap_uri.is_empty() {
            provision_bootstrap_server(
                &mut store,
                &registry,
                &options.bootstrap_uri,
                options.bootstrap_hold_off,
            )?;
        }

        Ok(Self {
            registry,
            store,
            attributes: AttributeStore::new(options.default_attributes),
            observers: ObserverSet::default(),
            endpoints,
            bootstrap,
            registrations: Vec::new(),
            registrations_built: false,
            bootstrap_reported: None,
            endpoint_name: options.endpoint_name,
            handler: options.handler,
        })
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Define an application object.
    pub fn define_object(
        &mut self,
        name: &str,
        object_id: u16,
        min_instances: u16,
        max_instances: u16,
    ) -> Result<(), Error> {
        self.registry
            .register_object(name, object_id, min_instances, max_instances)?;

        self.endpoints
            .insert(format!("/{object_id}"), EndpointKind::Object);

        Ok(())
    }

    /// Define a resource on an application object.
    #[allow(clippy::too_many_arguments)]
    pub fn define_resource(
        &mut self,
        object_id: u16,
        resource_id: u16,
        name: &str,
        resource_type: ResourceType,
        min_instances: u16,
        max_instances: u16,
        operations: ResourceOperations,
        default_value: Option<Bytes>,
    ) -> Result<(), Error> {
        Ok(self.registry.register_resource(
            object_id,
            resource_id,
            name,
            resource_type,
            min_instances,
            max_instances,
            operations,
            default_value,
        )?)
    }

    /// Create an object instance from the local application.
    pub fn create_object_instance(
        &mut self,
        object_id: u16,
        instance_id: Option<u16>,
    ) -> Result<u16, Error> {
        self.store
            .create_object_instance(&self.registry, Origin::Client, object_id, instance_id)
    }

    /// Create an optional resource with its default value (or an empty
    /// container for a multiple resource).
    pub fn create_resource(
        &mut self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<(), Error> {
        self.store.create_resource(
            &self.registry,
            Origin::Client,
            object_id,
            instance_id,
            resource_id,
        )
    }

    /// Write one resource instance from the local application. The change
    /// is picked up by observations at the next `process` tick.
    pub fn set_resource(
        &mut self,
        path: &Path,
        value: Bytes,
    ) -> Result<bool, Error> {
        let (Some(instance_id), Some(resource_id)) =
            (path.object_instance_id(), path.resource_id())
        else {
            return Err(Error::PathInvalid);
        };

        let changed = self.store.set_resource_instance(
            &self.registry,
            Origin::Client,
            path.object_id(),
            instance_id,
            resource_id,
            path.resource_instance_id().unwrap_or(0),
            value,
        )?;

        if changed {
            self.observers.mark_changed(path);
        }

        Ok(changed)
    }

    pub fn read(&self, path: &Path) -> Result<Node, Error> {
        self.store.read_node(&self.registry, Origin::Client, path)
    }

    /// Ask every registration machine for an early Update.
    pub fn request_registration_update(&mut self) {
        for machine in &mut self.registrations {
            machine.request_update();
        }
    }

    /// Route one received CoAP message: requests go through the
    /// dispatcher, responses feed the state machines.
    pub fn handle_message<U: Transport>(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
        transport: &mut U,
    ) {
        if message.code.is_request() {
            let response = self.dispatch(peer, message, now);
            if transport.send(peer, response).is_err() {
                log::warn!("response to {peer:?} failed to send");
            }

            // Flush anything the request changed under an observation.
            self.flush_notifications(now, transport);
            return;
        }

        for machine in &mut self.registrations {
            let Some(event) = machine.handle_response(peer, message, now) else {
                continue;
            };

            match event {
                RegistrationEvent::Registered { location } => {
                    self.handler.on_registered(machine.short_server_id, &location);
                }
                RegistrationEvent::Updated => {
                    self.handler.on_registration_updated(machine.short_server_id);
                }
                RegistrationEvent::Deregistered => {
                    self.handler.on_deregistered(machine.short_server_id);
                }
                RegistrationEvent::Failed => {
                    if machine.state() == crate::registration::RegistrationState::RegisterFailed {
                        self.handler.on_register_failed(machine.short_server_id);
                    }
                }
            }

            return;
        }
    }

    /// Advance every machine by one tick; returns how long the host may
    /// wait before calling again.
    pub fn process<U: Transport>(&mut self, now: Instant, transport: &mut U) -> Duration {
        let mut next = IDLE_TICK;
        let mut push = |slot: &mut Duration, value: Option<Duration>| {
            if let Some(value) = value {
                *slot = (*slot).min(value);
            }
        };

        let deadline = self.bootstrap.tick(now, &self.store, transport);
        push(&mut next, deadline);

        match self.bootstrap.state() {
            BootstrapState::BootStrapped => {
                if self.bootstrap_reported != Some(BootstrapState::BootStrapped) {
                    self.bootstrap_reported = Some(BootstrapState::BootStrapped);
                    self.handler.on_bootstrapped();
                }

                if !self.registrations_built {
                    self.registrations =
                        machines_from_store(&self.endpoint_name, &self.store);
                    self.registrations_built = true;
                }
            }
            BootstrapState::BootStrapFailed => {
                if self.bootstrap_reported != Some(BootstrapState::BootStrapFailed) {
                    self.bootstrap_reported = Some(BootstrapState::BootStrapFailed);
                    self.handler.on_bootstrap_failed();
                }
            }
            _ => {}
        }

        for machine in &mut self.registrations {
            let deadline = machine.tick(now, &self.registry, &self.store, transport);
            push(&mut next, deadline);
        }

        let deadline = self.flush_notifications(now, transport);
        push(&mut next, deadline);

        next
    }

    /// Drain outstanding retries, deregister everywhere, drop all
    /// observations.
    pub fn shutdown<U: Transport>(&mut self, now: Instant, transport: &mut U) {
        for machine in &mut self.registrations {
            machine.deregister();
            machine.tick(now, &self.registry, &self.store, transport);
        }

        self.observers.clear();
    }

    fn flush_notifications<U: Transport>(
        &mut self,
        now: Instant,
        transport: &mut U,
    ) -> Option<Duration> {
        let (deadline, emitted) = notify::tick(
            now,
            &self.registry,
            &self.store,
            &self.attributes,
            &mut self.observers,
            transport,
        );

        for notification in emitted {
            self.handler
                .on_notification(&notification.path, notification.sequence);
        }

        deadline
    }

    /// Identify the request origin: the open bootstrap conversation, a
    /// known server address, or an unknown server.
    fn origin_of(&self, peer: SocketAddr) -> Origin {
        if self.bootstrap.accepts_bootstrap_writes(peer) {
            return Origin::Bootstrap;
        }

        self.registrations
            .iter()
            .find(|it| it.peer() == peer)
            .map(|it| Origin::Server(it.short_server_id))
            .unwrap_or(Origin::Server(0))
    }

    fn dispatch(&mut self, peer: SocketAddr, message: &Message, now: Instant) -> Message {
        match self.dispatch_inner(peer, message, now) {
            Ok(response) => response,
            Err(error) => {
                log::debug!(
                    "request failed: peer={:?}, path={:?}, error={:?}",
                    peer,
                    message.uri_path(),
                    error
                );

                Message::response(message, error_code(&error))
            }
        }
    }

    fn dispatch_inner(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        now: Instant,
    ) -> Result<Message, Error> {
        let path_string = message.uri_path();

        // Bootstrap finish is the one non-object endpoint of a client.
        if self.endpoints.lookup(&path_string) == Some(EndpointKind::BootstrapFinish) {
            if message.code != Code::Post {
                return Err(Error::OperationNotPermitted);
            }

            return if self.bootstrap.finish(peer) {
                Ok(Message::response(message, Code::Changed))
            } else {
                Err(Error::Unauthorized)
            };
        }

        let path: Path = path_string.parse().map_err(|_| Error::PathInvalid)?;
        if self.endpoints.lookup(&path_string) != Some(EndpointKind::Object) {
            return Err(Error::NotFound);
        }

        let origin = self.origin_of(peer);
        let operation = operation_for(message, &path, &self.registry)?;

        match operation {
            Operation::Read => self.do_read(message, &path, origin),
            Operation::Observe => self.do_observe(peer, message, &path, origin, now),
            Operation::CancelObserve => {
                self.observers.cancel(peer, message.token(), &path);
                self.do_read(message, &path, origin)
            }
            Operation::Discover => self.do_discover(message, &path),
            Operation::Write { replace } => {
                self.do_write(message, &path, origin, replace)
            }
            Operation::WriteAttributes(attributes, cancel) => {
                self.do_write_attributes(peer, message, &path, attributes, cancel)
            }
            Operation::Execute => self.do_execute(message, &path, origin),
            Operation::Create => self.do_create(message, &path, origin),
            Operation::Delete => self.do_delete(message, &path, origin),
        }
    }

    fn accept_format(&self, message: &Message) -> Result<ContentFormat, Error> {
        match message.accept() {
            Some(value) => ContentFormat::from_media_type(value).ok_or(Error::CodecNotFound),
            None => Ok(ContentFormat::Tlv),
        }
    }

    fn content_format(&self, message: &Message) -> Result<ContentFormat, Error> {
        let value = message.content_format().ok_or(Error::CodecNotFound)?;
        ContentFormat::from_media_type(value).ok_or(Error::CodecNotFound)
    }

    fn do_read(
        &mut self,
        message: &Message,
        path: &Path,
        origin: Origin,
    ) -> Result<Message, Error> {
        let format = self.accept_format(message)?;
        let node = self.store.read_node(&self.registry, origin, path)?;
        let payload = serdes::encode(format, &node, path, None)?;

        let mut response = Message::response(message, Code::Content);
        response.set_content_format(format.into());
        response.set_payload(payload);

        Ok(response)
    }

    fn do_observe(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        path: &Path,
        origin: Origin,
        now: Instant,
    ) -> Result<Message, Error> {
        let format = self.accept_format(message)?;
        let node = self.store.read_node(&self.registry, origin, path)?;
        let payload = serdes::encode(format, &node, path, None)?;

        let current = path
            .resource_id()
            .and_then(|resource_id| self.registry.lookup_resource(path.object_id(), resource_id))
            .filter(|it| it.resource_type.is_numeric() && !it.multiple())
            .and_then(|definition| {
                let bytes = self
                    .store
                    .get_resource_instance(
                        path.object_id(),
                        path.object_instance_id()?,
                        definition.id,
                        0,
                    )
                    .ok()?;

                codec::value::decode_numeric(definition.resource_type, bytes).ok()
            });

        let observation = self.observers.observe(peer, message.token(), *path, format);
        let sequence = observation.next_sequence();
        observation.last_emit = Some(now);
        observation.last_numeric = current;

        let mut response = Message::response(message, Code::Content);
        response.set_observe(sequence);
        response.set_content_format(format.into());
        response.set_payload(payload);

        Ok(response)
    }

    fn do_discover(&mut self, message: &Message, path: &Path) -> Result<Message, Error> {
        let object = self
            .registry
            .lookup_object(path.object_id())
            .ok_or(Error::NotFound)?;

        let attach = |link: Link, path: &Path, attributes: &AttributeStore| {
            let resolved = attributes.resolve(path);
            let mut link = link;

            if let Some(pmin) = resolved.pmin {
                link = link.with_param("pmin", pmin);
            }

            if let Some(pmax) = resolved.pmax {
                link = link.with_param("pmax", pmax);
            }

            if let Some(gt) = resolved.gt {
                link = link.with_param("gt", gt);
            }

            if let Some(lt) = resolved.lt {
                link = link.with_param("lt", lt);
            }

            if let Some(step) = resolved.step {
                link = link.with_param("st", step);
            }

            link
        };

        let mut links = Vec::new();
        match (path.object_instance_id(), path.resource_id()) {
            (None, _) => {
                links.push(attach(
                    Link::new(format!("/{}", object.id)),
                    path,
                    &self.attributes,
                ));

                for instance_id in self.store.instance_ids(object.id).collect::<Vec<u16>>() {
                    links.push(Link::new(format!("/{}/{}", object.id, instance_id)));

                    for resource_id in self
                        .store
                        .resource_ids(object.id, instance_id)
                        .collect::<Vec<u16>>()
                    {
                        links.push(Link::new(format!(
                            "/{}/{}/{}",
                            object.id, instance_id, resource_id
                        )));
                    }
                }
            }
            (Some(instance_id), None) => {
                links.push(Link::new(format!("/{}/{}", object.id, instance_id)));
                for resource_id in self
                    .store
                    .resource_ids(object.id, instance_id)
                    .collect::<Vec<u16>>()
                {
                    links.push(Link::new(format!(
                        "/{}/{}/{}",
                        object.id, instance_id, resource_id
                    )));
                }
            }
            (Some(instance_id), Some(resource_id)) => {
                let definition = self
                    .registry
                    .lookup_resource(object.id, resource_id)
                    .ok_or(Error::NotFound)?;

                let mut link = attach(
                    Link::new(format!("/{}/{}/{}", object.id, instance_id, resource_id)),
                    path,
                    &self.attributes,
                );

                if definition.multiple() {
                    let dim = self
                        .store
                        .resource_instance_ids(object.id, instance_id, resource_id)
                        .count();

                    link = link.with_param("dim", dim);
                }

                links.push(link);
            }
        }

        let mut response = Message::response(message, Code::Content);
        response.set_content_format(ContentFormat::LinkFormat.into());
        response.set_payload(Bytes::from(serialise(&links).into_bytes()));

        Ok(response)
    }

    fn do_write(
        &mut self,
        message: &Message,
        path: &Path,
        origin: Origin,
        replace: bool,
    ) -> Result<Message, Error> {
        // There is no object-level Write on the Device Management
        // interface; only provisioning touches a whole object.
        if path.is_object() && origin != Origin::Bootstrap {
            return Err(Error::OperationNotPermitted);
        }

        let format = self.content_format(message)?;
        let node = serdes::decode(format, &self.registry, path, &message.payload)?;

        // Replace clears unmentioned resources, which is only meaningful
        // when the request addresses a whole instance.
        let mode = match origin {
            Origin::Bootstrap => WriteMode::Upsert,
            _ if replace && path.is_object_instance() => WriteMode::Replace,
            _ => WriteMode::Update,
        };

        let (changed, _) =
            self.store
                .apply_node(&self.registry, origin, path, &node, mode)?;

        for path in &changed {
            self.observers.mark_changed(path);
        }

        Ok(Message::response(message, Code::Changed))
    }

    fn do_write_attributes(
        &mut self,
        peer: SocketAddr,
        message: &Message,
        path: &Path,
        attributes: NotificationAttributes,
        cancel: bool,
    ) -> Result<Message, Error> {
        if cancel {
            self.observers.cancel_path(peer, path);
        }

        let has_thresholds =
            attributes.gt.is_some() || attributes.lt.is_some() || attributes.step.is_some();

        if has_thresholds {
            let numeric_single = path
                .resource_id()
                .and_then(|id| self.registry.lookup_resource(path.object_id(), id))
                .map(|it| it.resource_type.is_numeric() && !it.multiple())
                .unwrap_or(false);

            if !numeric_single {
                return Err(Error::OperationNotPermitted);
            }
        }

        if !attributes.is_empty() {
            self.attributes.set(*path, attributes);
        }

        Ok(Message::response(message, Code::Changed))
    }

    fn do_execute(
        &mut self,
        message: &Message,
        path: &Path,
        origin: Origin,
    ) -> Result<Message, Error> {
        let (Some(instance_id), Some(resource_id)) =
            (path.object_instance_id(), path.resource_id())
        else {
            return Err(Error::OperationNotPermitted);
        };

        if !self.store.exists(&Path::object_instance(path.object_id(), instance_id)) {
            return Err(Error::NotFound);
        }

        let definition = self
            .registry
            .lookup_resource(path.object_id(), resource_id)
            .ok_or(Error::NotDefined)?;

        self.store.check_execute(
            &self.registry,
            origin,
            path.object_id(),
            instance_id,
            definition,
        )?;

        // The Server object's update trigger acts on the registration
        // machine directly; everything else is the application's business.
        if path.object_id() == server::OBJECT_ID
            && resource_id == server::REGISTRATION_UPDATE_TRIGGER
        {
            let short_server_id = self
                .store
                .integer(server::OBJECT_ID, instance_id, server::SHORT_SERVER_ID)
                .unwrap_or(0) as u16;

            for machine in &mut self.registrations {
                if machine.short_server_id == short_server_id {
                    machine.request_update();
                }
            }
        }

        self.handler
            .on_execute(&path.to_string(), &message.payload);

        Ok(Message::response(message, Code::Changed))
    }

    fn do_create(
        &mut self,
        message: &Message,
        path: &Path,
        origin: Origin,
    ) -> Result<Message, Error> {
        let format = self.content_format(message)?;
        let node = serdes::decode(format, &self.registry, path, &message.payload)?;

        let (changed, created) =
            self.store
                .apply_node(&self.registry, origin, path, &node, WriteMode::Create)?;

        for path in &changed {
            self.observers.mark_changed(path);
        }

        let created = created.ok_or(Error::CannotCreate)?;

        let mut response = Message::response(message, Code::Created);
        response.set_location_path(&format!("/{}/{}", path.object_id(), created));

        Ok(response)
    }

    fn do_delete(
        &mut self,
        message: &Message,
        path: &Path,
        origin: Origin,
    ) -> Result<Message, Error> {
        // Protocol deletes address instances; whole-object deletion is a
        // provisioning action.
        if path.is_object() && origin != Origin::Bootstrap {
            return Err(Error::OperationNotPermitted);
        }

        self.store.delete(&self.registry, origin, path)?;
        self.observers.mark_changed(path);

        Ok(Message::response(message, Code::Deleted))
    }
}

fn apply_factory_bootstrap(
    store: &mut ObjectStore,
    registry: &DefinitionRegistry,
    factory: &FactoryBootstrap,
) -> Result<(), Error> {
    let instance_id =
        store.create_object_instance(registry, Origin::Bootstrap, security::OBJECT_ID, None)?;

    for (resource_id, value) in [
        (
            security::SERVER_URI,
            Bytes::from(factory.security.server_uri.clone().into_bytes()),
        ),
        (
            security::BOOTSTRAP,
            Bytes::from(vec![factory.security.bootstrap as u8]),
        ),
        (
            security::SHORT_SERVER_ID,
            codec::value::encode_integer(factory.security.short_server_id as i64),
        ),
        (
            security::HOLD_OFF_TIME,
            codec::value::encode_integer(factory.security.hold_off_time as i64),
        ),
    ] {
        store.set_resource_instance(
            registry,
            Origin::Bootstrap,
            security::OBJECT_ID,
            instance_id,
            resource_id,
            0,
            value,
        )?;
    }

    let instance_id =
        store.create_object_instance(registry, Origin::Bootstrap, server::OBJECT_ID, None)?;

    for (resource_id, value) in [
        (
            server::SHORT_SERVER_ID,
            codec::value::encode_integer(factory.server.short_server_id as i64),
        ),
        (
            server::LIFETIME,
            codec::value::encode_integer(factory.server.lifetime as i64),
        ),
        (
            server::BINDING,
            Bytes::from(factory.server.binding.clone().into_bytes()),
        ),
        (server::NOTIFICATION_STORING, Bytes::from_static(&[0])),
    ] {
        store.set_resource_instance(
            registry,
            Origin::Bootstrap,
            server::OBJECT_ID,
            instance_id,
            resource_id,
            0,
            value,
        )?;
    }

    Ok(())
}

fn provision_bootstrap_server(
    store: &mut ObjectStore,
    registry: &DefinitionRegistry,
    uri: &str,
    hold_off: u32,
) -> Result<(), Error> {
    let instance_id =
        store.create_object_instance(registry, Origin::Bootstrap, security::OBJECT_ID, None)?;

    for (resource_id, value) in [
        (security::SERVER_URI, Bytes::from(uri.as_bytes().to_vec())),
        (security::BOOTSTRAP, Bytes::from_static(&[1])),
        (
            security::HOLD_OFF_TIME,
            codec::value::encode_integer(hold_off as i64),
        ),
    ] {
        store.set_resource_instance(
            registry,
            Origin::Bootstrap,
            security::OBJECT_ID,
            instance_id,
            resource_id,
            0,
            value,
        )?;
    }

    Ok(())
}
