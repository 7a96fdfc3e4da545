//! The in-memory object store: an ordered, four-level sparse tree of
//! object, object instance, resource and resource instance.
//!
//! Every mutation bumps a store-wide monotonic version and stamps the
//! touched nodes with it, which is what the notification engine keys on.
//! Single-instance resources live under the synthetic resource-instance
//! id 0.

use bytes::Bytes;

use codec::{
    node::{Node, NodeKind},
    path::{MAX_ID, Path},
    registry::{DefinitionRegistry, ResourceDefinition},
    value::{ResourceType, decode_integer},
};

use std::collections::BTreeMap;

use crate::Error;

/// Who a store mutation or permission check acts for.
///
/// Bootstrap writes are provisioning, not protocol traffic, and bypass
/// resource-level operation checks. Server requests carry the short server
/// id the Access Control object keys its masks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server(u16),
    Bootstrap,
}

/// How a decoded tree grafts onto existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// POST partial update: the instance must exist, untouched resources
    /// survive.
    Update,
    /// PUT replace: the instance must exist, non-mandatory resources the
    /// payload does not carry are dropped.
    Replace,
    /// Create: the instance must not exist.
    Create,
    /// Bootstrap provisioning: create what is missing, replace what is
    /// there.
    Upsert,
}

/// Access Control object (/2) mask bits.
const ACL_READ: i64 = 1;
const ACL_WRITE: i64 = 1 << 1;
const ACL_EXECUTE: i64 = 1 << 2;
const ACL_DELETE: i64 = 1 << 3;
const ACL_CREATE: i64 = 1 << 4;

#[derive(Debug, Default)]
struct ResourceInstanceSlot {
    value: Bytes,
    version: u64,
}

#[derive(Debug, Default)]
struct ResourceSlot {
    instances: BTreeMap<u16, ResourceInstanceSlot>,
    version: u64,
}

#[derive(Debug, Default)]
struct ObjectInstanceSlot {
    resources: BTreeMap<u16, ResourceSlot>,
    version: u64,
}

#[derive(Debug, Default)]
struct ObjectSlot {
    instances: BTreeMap<u16, ObjectInstanceSlot>,
    version: u64,
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: BTreeMap<u16, ObjectSlot>,
    version: u64,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store-wide version tick of the most recent mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The version a node was last mutated at.
    pub fn node_version(&self, path: &Path) -> Option<u64> {
        let object = self.objects.get(&path.object_id())?;
        let Some(instance_id) = path.object_instance_id() else {
            return Some(object.version);
        };

        let instance = object.instances.get(&instance_id)?;
        let Some(resource_id) = path.resource_id() else {
            return Some(instance.version);
        };

        let resource = instance.resources.get(&resource_id)?;
        let Some(resource_instance_id) = path.resource_instance_id() else {
            return Some(resource.version);
        };

        resource
            .instances
            .get(&resource_instance_id)
            .map(|it| it.version)
    }

    fn tick(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.node_version(path).is_some()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = u16> {
        self.objects.keys().copied()
    }

    pub fn instance_ids(&self, object_id: u16) -> impl Iterator<Item = u16> {
        self.objects
            .get(&object_id)
            .into_iter()
            .flat_map(|it| it.instances.keys().copied())
    }

    pub fn resource_ids(&self, object_id: u16, instance_id: u16) -> impl Iterator<Item = u16> {
        self.objects
            .get(&object_id)
            .and_then(|it| it.instances.get(&instance_id))
            .into_iter()
            .flat_map(|it| it.resources.keys().copied())
    }

    pub fn resource_instance_ids(
        &self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> impl Iterator<Item = u16> {
        self.objects
            .get(&object_id)
            .and_then(|it| it.instances.get(&instance_id))
            .and_then(|it| it.resources.get(&resource_id))
            .into_iter()
            .flat_map(|it| it.instances.keys().copied())
    }

    /// Convenience integer read, used by the state machines to consult the
    /// Security and Server objects.
    pub fn integer(&self, object_id: u16, instance_id: u16, resource_id: u16) -> Option<i64> {
        decode_integer(
            self.get_resource_instance(object_id, instance_id, resource_id, 0)
                .ok()?,
        )
        .ok()
    }

    pub fn string(&self, object_id: u16, instance_id: u16, resource_id: u16) -> Option<String> {
        std::str::from_utf8(
            self.get_resource_instance(object_id, instance_id, resource_id, 0)
                .ok()?,
        )
        .ok()
        .map(str::to_string)
    }

    pub fn boolean(&self, object_id: u16, instance_id: u16, resource_id: u16) -> Option<bool> {
        match self
            .get_resource_instance(object_id, instance_id, resource_id, 0)
            .ok()?
        {
            [0] => Some(false),
            [1] => Some(true),
            _ => None,
        }
    }

    /// Look up the ACL mask the Access Control object grants `origin` on
    /// the target. Absent ACL instances leave everything permitted.
    fn acl_permits(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        access: i64,
    ) -> bool {
        let Origin::Server(short_server_id) = origin else {
            return true;
        };

        if registry.lookup_object(2).is_none() {
            return true;
        }

        for acl_instance in self.instance_ids(2).collect::<Vec<u16>>() {
            if self.integer(2, acl_instance, 0) != Some(object_id as i64) {
                continue;
            }

            if self.integer(2, acl_instance, 1) != Some(instance_id as i64) {
                continue;
            }

            // The access-control owner keeps full rights.
            if self.integer(2, acl_instance, 3) == Some(short_server_id as i64) {
                return true;
            }

            let mask = self
                .get_resource_instance(2, acl_instance, 2, short_server_id)
                .ok()
                .and_then(|it| decode_integer(it).ok())
                // Resource instance 0 holds the default mask.
                .or_else(|| {
                    self.get_resource_instance(2, acl_instance, 2, 0)
                        .ok()
                        .and_then(|it| decode_integer(it).ok())
                })
                .unwrap_or(0);

            return mask & access != 0;
        }

        true
    }

    fn check_write(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        definition: &ResourceDefinition,
    ) -> Result<(), Error> {
        match origin {
            Origin::Bootstrap => Ok(()),
            Origin::Client => Ok(()),
            Origin::Server(_) => {
                if !definition.operations.writable() {
                    return Err(Error::OperationNotPermitted);
                }

                if !self.acl_permits(registry, origin, object_id, instance_id, ACL_WRITE) {
                    return Err(Error::Unauthorized);
                }

                Ok(())
            }
        }
    }

    pub fn check_read(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        definition: &ResourceDefinition,
    ) -> Result<(), Error> {
        match origin {
            Origin::Bootstrap | Origin::Client => Ok(()),
            Origin::Server(_) => {
                if !definition.operations.readable() {
                    return Err(Error::Unauthorized);
                }

                if !self.acl_permits(registry, origin, object_id, instance_id, ACL_READ) {
                    return Err(Error::Unauthorized);
                }

                Ok(())
            }
        }
    }

    pub fn check_execute(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        definition: &ResourceDefinition,
    ) -> Result<(), Error> {
        if !definition.operations.executable() {
            return Err(Error::OperationNotPermitted);
        }

        if !self.acl_permits(registry, origin, object_id, instance_id, ACL_EXECUTE) {
            return Err(Error::Unauthorized);
        }

        Ok(())
    }

    /// Create an object instance, allocating the smallest unused id when
    /// none is given.
    pub fn create_object_instance(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: Option<u16>,
    ) -> Result<u16, Error> {
        let definition = registry.lookup_object(object_id).ok_or(Error::NotDefined)?;

        let count = self
            .objects
            .get(&object_id)
            .map(|it| it.instances.len())
            .unwrap_or(0);

        if count >= definition.max_instances as usize {
            return Err(Error::CannotCreate);
        }

        let taken = |id: &u16| {
            self.objects
                .get(&object_id)
                .map(|it| it.instances.contains_key(id))
                .unwrap_or(false)
        };

        let id = match instance_id {
            Some(id) => {
                if id > MAX_ID || taken(&id) {
                    return Err(Error::CannotCreate);
                }

                id
            }
            None => (0..=MAX_ID).find(|id| !taken(id)).ok_or(Error::CannotCreate)?,
        };

        if matches!(origin, Origin::Server(_))
            && !self.acl_permits(registry, origin, object_id, id, ACL_CREATE)
        {
            return Err(Error::Unauthorized);
        }

        let version = self.tick();
        let object = self.objects.entry(object_id).or_default();
        object.version = version;
        object.instances.insert(
            id,
            ObjectInstanceSlot {
                resources: BTreeMap::new(),
                version,
            },
        );

        Ok(id)
    }

    /// Create an optional resource: an empty container for a multiple
    /// resource, a default-valued single instance otherwise.
    pub fn create_resource(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<(), Error> {
        let definition = registry
            .lookup_resource(object_id, resource_id)
            .ok_or(Error::NotDefined)?
            .clone();

        self.check_write(registry, origin, object_id, instance_id, &definition)?;

        if !self.exists(&Path::object_instance(object_id, instance_id)) {
            return Err(Error::NotFound);
        }

        if self.exists(&Path::resource(object_id, instance_id, resource_id)) {
            return Err(Error::CannotCreate);
        }

        let version = self.tick();
        let object = self.objects.get_mut(&object_id).ok_or(Error::NotFound)?;
        let instance = object
            .instances
            .get_mut(&instance_id)
            .ok_or(Error::NotFound)?;

        let mut slot = ResourceSlot {
            instances: BTreeMap::new(),
            version,
        };

        if !definition.multiple() && !definition.operations.executable() {
            slot.instances.insert(
                0,
                ResourceInstanceSlot {
                    value: definition
                        .default_value
                        .clone()
                        .unwrap_or_else(|| default_value(definition.resource_type)),
                    version,
                },
            );
        }

        object.version = version;
        instance.version = version;
        instance.resources.insert(resource_id, slot);

        Ok(())
    }

    /// Write one resource instance. Returns whether the stored bytes
    /// changed, which is what drives notifications.
    pub fn set_resource_instance(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        resource_instance_id: u16,
        bytes: Bytes,
    ) -> Result<bool, Error> {
        let definition = registry
            .lookup_resource(object_id, resource_id)
            .ok_or(Error::NotDefined)?
            .clone();

        if definition.max_instances == 0 {
            return Err(Error::OperationNotPermitted);
        }

        self.check_write(registry, origin, object_id, instance_id, &definition)?;
        definition.resource_type.check_width(bytes.len())?;

        if !definition.multiple() && resource_instance_id != 0 {
            return Err(Error::CannotCreate);
        }

        let version = self.version + 1;
        let object = self.objects.get_mut(&object_id).ok_or(Error::NotFound)?;
        let instance = object
            .instances
            .get_mut(&instance_id)
            .ok_or(Error::NotFound)?;

        if let Some(resource) = instance.resources.get(&resource_id) {
            if !resource.instances.contains_key(&resource_instance_id)
                && resource.instances.len() >= definition.max_instances as usize
            {
                return Err(Error::CannotCreate);
            }
        }

        let resource = instance.resources.entry(resource_id).or_default();
        let slot = resource.instances.entry(resource_instance_id).or_default();
        let changed = slot.value != bytes;

        slot.value = bytes;
        slot.version = version;
        resource.version = version;
        instance.version = version;
        object.version = version;
        self.version = version;

        Ok(changed)
    }

    pub fn get_resource_instance(
        &self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        resource_instance_id: u16,
    ) -> Result<&[u8], Error> {
        self.objects
            .get(&object_id)
            .and_then(|it| it.instances.get(&instance_id))
            .and_then(|it| it.resources.get(&resource_id))
            .and_then(|it| it.instances.get(&resource_instance_id))
            .map(|it| it.value.as_ref())
            .ok_or(Error::NotFound)
    }

    /// Delete the sub-tree rooted at `path`.
    ///
    /// Mandatory entities are protected from everything but Bootstrap: the
    /// provisioning phase may rewrite anything, protocol peers and the
    /// local application may not remove what the schema requires.
    pub fn delete(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        path: &Path,
    ) -> Result<(), Error> {
        if !self.exists(path) {
            return Err(Error::NotFound);
        }

        if origin != Origin::Bootstrap {
            if let Some(resource_id) = path.resource_id() {
                let definition = registry
                    .lookup_resource(path.object_id(), resource_id)
                    .ok_or(Error::NotDefined)?;

                if definition.mandatory() {
                    return Err(Error::OperationNotPermitted);
                }
            } else if let Some(instance_id) = path.object_instance_id() {
                let definition = registry
                    .lookup_object(path.object_id())
                    .ok_or(Error::NotDefined)?;

                let count = self.instance_ids(path.object_id()).count();
                if count <= definition.min_instances as usize {
                    return Err(Error::OperationNotPermitted);
                }

                if !self.acl_permits(
                    registry,
                    origin,
                    path.object_id(),
                    instance_id,
                    ACL_DELETE,
                ) {
                    return Err(Error::Unauthorized);
                }
            }
        }

        let version = self.tick();

        let Some(instance_id) = path.object_instance_id() else {
            self.objects.remove(&path.object_id());
            return Ok(());
        };

        let object = self
            .objects
            .get_mut(&path.object_id())
            .ok_or(Error::NotFound)?;
        object.version = version;

        let Some(resource_id) = path.resource_id() else {
            object.instances.remove(&instance_id);
            return Ok(());
        };

        let instance = object
            .instances
            .get_mut(&instance_id)
            .ok_or(Error::NotFound)?;
        instance.version = version;

        let Some(resource_instance_id) = path.resource_instance_id() else {
            instance.resources.remove(&resource_id);
            return Ok(());
        };

        let resource = instance
            .resources
            .get_mut(&resource_id)
            .ok_or(Error::NotFound)?;
        resource.version = version;
        resource.instances.remove(&resource_instance_id);

        Ok(())
    }

    fn read_resource_node(
        &self,
        definition: &ResourceDefinition,
        object_id: u16,
        instance_id: u16,
    ) -> Option<Node> {
        let resource = self
            .objects
            .get(&object_id)?
            .instances
            .get(&instance_id)?
            .resources
            .get(&definition.id)?;

        let mut node = Node::new(NodeKind::Resource, Some(definition.id));
        node.set_resource_type(definition.resource_type);

        for (id, slot) in &resource.instances {
            node.add_child(Node::with_value(
                NodeKind::ResourceInstance,
                Some(*id),
                slot.value.clone(),
            ));
        }

        Some(node)
    }

    fn read_instance_node(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance_id: u16,
    ) -> Result<Node, Error> {
        let mut node = Node::new(NodeKind::ObjectInstance, Some(instance_id));

        for resource_id in self.resource_ids(object_id, instance_id).collect::<Vec<u16>>() {
            let definition = registry
                .lookup_resource(object_id, resource_id)
                .ok_or(Error::NotDefined)?;

            // Aggregate reads skip what this origin may not see rather
            // than failing the whole request.
            if definition.operations.executable()
                || self
                    .check_read(registry, origin, object_id, instance_id, definition)
                    .is_err()
            {
                continue;
            }

            if let Some(resource) = self.read_resource_node(definition, object_id, instance_id) {
                node.add_child(resource);
            }
        }

        Ok(node)
    }

    /// Build the detached tree for a Read of `path`.
    pub fn read_node(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        path: &Path,
    ) -> Result<Node, Error> {
        if !self.exists(path) {
            return Err(Error::NotFound);
        }

        let object_id = path.object_id();
        match (path.object_instance_id(), path.resource_id()) {
            (None, _) => {
                let mut node = Node::new(NodeKind::Object, Some(object_id));
                for instance_id in self.instance_ids(object_id).collect::<Vec<u16>>() {
                    node.add_child(self.read_instance_node(
                        registry, origin, object_id, instance_id,
                    )?);
                }

                Ok(node)
            }
            (Some(instance_id), None) => {
                self.read_instance_node(registry, origin, object_id, instance_id)
            }
            (Some(instance_id), Some(resource_id)) => {
                let definition = registry
                    .lookup_resource(object_id, resource_id)
                    .ok_or(Error::NotDefined)?;

                self.check_read(registry, origin, object_id, instance_id, definition)?;
                self.read_resource_node(definition, object_id, instance_id)
                    .ok_or(Error::NotFound)
            }
        }
    }

    /// Graft a decoded tree into the store, all-or-nothing.
    ///
    /// `path` is the request target the tree was decoded against; ids the
    /// tree does not carry (an instance-level write, a resource-level
    /// write) come from it. The whole tree is validated (definitions,
    /// permissions, widths, cardinality) before the first byte is written;
    /// a failing entry leaves the store untouched. Returns the paths whose
    /// stored bytes changed and the instance id created for a Create.
    pub fn apply_node(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        path: &Path,
        node: &Node,
        mode: WriteMode,
    ) -> Result<(Vec<Path>, Option<u16>), Error> {
        let object_id = path.object_id();

        // Normalize every request shape to a list of instance trees.
        let instances: Vec<Node> = match node.kind() {
            NodeKind::Object => node.children().cloned().collect(),
            NodeKind::ObjectInstance => {
                let mut instance = node.clone();
                if instance.id().is_none() {
                    instance.set_id(path.object_instance_id());
                }

                vec![instance]
            }
            NodeKind::Resource => {
                let mut instance =
                    Node::new(NodeKind::ObjectInstance, path.object_instance_id());
                instance.add_child(node.clone());
                vec![instance]
            }
            _ => return Err(Error::Internal),
        };

        let mut changed = Vec::new();
        let mut created = None;

        // Validate every instance before applying any.
        for instance in &instances {
            self.validate_instance(registry, origin, object_id, instance, mode)?;
        }

        for instance in &instances {
            let (mut paths, id) =
                self.apply_instance(registry, origin, object_id, instance, mode)?;
            changed.append(&mut paths);
            created = created.or(id);
        }

        Ok((changed, created))
    }

    fn validate_instance(
        &self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance: &Node,
        mode: WriteMode,
    ) -> Result<(), Error> {
        let definition = registry.lookup_object(object_id).ok_or(Error::NotDefined)?;

        let exists = instance
            .id()
            .map(|id| self.exists(&Path::object_instance(object_id, id)))
            .unwrap_or(false);

        match mode {
            WriteMode::Create => {
                if exists {
                    return Err(Error::CannotCreate);
                }

                let count = self.instance_ids(object_id).count();
                if count >= definition.max_instances as usize {
                    return Err(Error::CannotCreate);
                }
            }
            WriteMode::Update | WriteMode::Replace => {
                if !exists {
                    return Err(Error::NotFound);
                }
            }
            WriteMode::Upsert => {
                if !exists {
                    let count = self.instance_ids(object_id).count();
                    if count >= definition.max_instances as usize {
                        return Err(Error::CannotCreate);
                    }
                }
            }
        }

        for resource in instance.children() {
            let resource_id = resource.id().ok_or(Error::DecodeError)?;
            let definition = registry
                .lookup_resource(object_id, resource_id)
                .ok_or(Error::NotDefined)?;

            if definition.max_instances == 0 {
                return Err(Error::OperationNotPermitted);
            }

            if matches!(mode, WriteMode::Update | WriteMode::Replace) {
                self.check_write(
                    registry,
                    origin,
                    object_id,
                    instance.id().unwrap_or(0),
                    definition,
                )?;
            }

            if resource.children().count() > definition.max_instances as usize {
                return Err(Error::CannotCreate);
            }

            for resource_instance in resource.children() {
                let value = resource_instance.value().ok_or(Error::DecodeError)?;
                definition.resource_type.check_width(value.len())?;

                if !definition.multiple() && resource_instance.id().unwrap_or(0) != 0 {
                    return Err(Error::CannotCreate);
                }
            }
        }

        Ok(())
    }

    fn apply_instance(
        &mut self,
        registry: &DefinitionRegistry,
        origin: Origin,
        object_id: u16,
        instance: &Node,
        mode: WriteMode,
    ) -> Result<(Vec<Path>, Option<u16>), Error> {
        let mut created = None;

        let instance_id = match instance.id() {
            Some(id) if self.exists(&Path::object_instance(object_id, id)) => id,
            id => {
                let id = self.create_object_instance(registry, origin, object_id, id)?;
                created = Some(id);
                id
            }
        };

        // Initial values on a freshly created instance are provisioning,
        // not protocol writes; the operations mask does not gate them.
        let set_origin = if matches!(mode, WriteMode::Create | WriteMode::Upsert) {
            Origin::Bootstrap
        } else {
            origin
        };

        if matches!(mode, WriteMode::Replace | WriteMode::Upsert) {
            // A Write that replaces clears what the payload does not carry.
            for resource_id in self
                .resource_ids(object_id, instance_id)
                .collect::<Vec<u16>>()
            {
                if instance.child(resource_id).is_none() {
                    let mandatory = registry
                        .lookup_resource(object_id, resource_id)
                        .map(|it| it.mandatory())
                        .unwrap_or(false);

                    if !mandatory {
                        let _ = self.delete(
                            registry,
                            Origin::Bootstrap,
                            &Path::resource(object_id, instance_id, resource_id),
                        );
                    }
                }
            }
        }

        let mut changed = Vec::new();
        for resource in instance.children() {
            let resource_id = resource.id().ok_or(Error::DecodeError)?;
            for resource_instance in resource.children() {
                let resource_instance_id = resource_instance.id().unwrap_or(0);
                let value = resource_instance.value().ok_or(Error::DecodeError)?;

                if self.set_resource_instance(
                    registry,
                    set_origin,
                    object_id,
                    instance_id,
                    resource_id,
                    resource_instance_id,
                    value.clone(),
                )? {
                    changed.push(Path::resource_instance(
                        object_id,
                        instance_id,
                        resource_id,
                        resource_instance_id,
                    ));
                }
            }
        }

        Ok((changed, created))
    }
}

fn default_value(resource_type: ResourceType) -> Bytes {
    match resource_type.scalar() {
        ResourceType::Integer | ResourceType::Time => Bytes::from_static(&[0]),
        ResourceType::Float => Bytes::from_static(&[0, 0, 0, 0]),
        ResourceType::Boolean => Bytes::from_static(&[0]),
        ResourceType::ObjectLink => Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]),
        _ => Bytes::new(),
    }
}
