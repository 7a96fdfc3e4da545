use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{Error, path::MAX_ID, value::ResourceType};

/// Operations a resource permits to protocol peers.
///
/// Executable resources are always `None`-typed singletons; the registry
/// enforces that at definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperations {
    None,
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl ResourceOperations {
    pub fn readable(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    pub fn executable(&self) -> bool {
        matches!(self, Self::Execute)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub id: u16,
    pub name: String,
    pub resource_type: ResourceType,
    pub min_instances: u16,
    pub max_instances: u16,
    pub operations: ResourceOperations,
    pub default_value: Option<Bytes>,
}

impl ResourceDefinition {
    pub fn mandatory(&self) -> bool {
        self.min_instances > 0
    }

    pub fn multiple(&self) -> bool {
        self.max_instances > 1
    }
}

#[derive(Debug, Clone)]
pub struct ObjectDefinition {
    pub id: u16,
    pub name: String,
    pub min_instances: u16,
    pub max_instances: u16,
    resources: BTreeMap<u16, ResourceDefinition>,
}

impl ObjectDefinition {
    pub fn mandatory(&self) -> bool {
        self.min_instances > 0
    }

    pub fn resource(&self, resource_id: u16) -> Option<&ResourceDefinition> {
        self.resources.get(&resource_id)
    }

    /// Resources in ascending id order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.resources.values()
    }
}

/// Schemas for every object a session knows about.
///
/// Append-only within a session: definitions are immutable once added and
/// duplicate ids are rejected without touching the existing entry.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::registry::{DefinitionRegistry, ResourceOperations};
/// use lwm2m_stack_codec::value::ResourceType;
///
/// let mut registry = DefinitionRegistry::new();
/// registry.register_object("Device", 3, 1, 1).unwrap();
/// registry
///     .register_resource(3, 0, "Manufacturer", ResourceType::String, 0, 1,
///                        ResourceOperations::Read, None)
///     .unwrap();
///
/// assert!(registry.register_object("Device", 3, 1, 1).is_err());
/// assert_eq!(registry.lookup_resource(3, 0).unwrap().name, "Manufacturer");
/// ```
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    objects: BTreeMap<u16, ObjectDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_object(
        &mut self,
        name: &str,
        object_id: u16,
        min_instances: u16,
        max_instances: u16,
    ) -> Result<(), Error> {
        if min_instances > max_instances || max_instances > MAX_ID {
            return Err(Error::DefinitionInvalid);
        }

        if self.objects.contains_key(&object_id) {
            return Err(Error::AlreadyDefined);
        }

        self.objects.insert(
            object_id,
            ObjectDefinition {
                id: object_id,
                name: name.to_string(),
                min_instances,
                max_instances,
                resources: BTreeMap::new(),
            },
        );

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_resource(
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
        if min_instances > max_instances || max_instances > MAX_ID {
            return Err(Error::DefinitionInvalid);
        }

        // Executable resources carry no value and no instances beyond the
        // implicit one.
        if operations.executable() && (resource_type != ResourceType::None || max_instances > 1) {
            return Err(Error::DefinitionInvalid);
        }

        if resource_type.is_array() && max_instances <= 1 {
            return Err(Error::DefinitionInvalid);
        }

        let object = self.objects.get_mut(&object_id).ok_or(Error::NotDefined)?;
        if object.resources.contains_key(&resource_id) {
            return Err(Error::AlreadyDefined);
        }

        object.resources.insert(
            resource_id,
            ResourceDefinition {
                id: resource_id,
                name: name.to_string(),
                resource_type,
                min_instances,
                max_instances,
                operations,
                default_value,
            },
        );

        Ok(())
    }

    pub fn lookup_object(&self, object_id: u16) -> Option<&ObjectDefinition> {
        self.objects.get(&object_id)
    }

    pub fn lookup_resource(&self, object_id: u16, resource_id: u16) -> Option<&ResourceDefinition> {
        self.objects.get(&object_id)?.resource(resource_id)
    }

    /// Objects in ascending id order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.objects.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_cardinality() {
        let mut registry = DefinitionRegistry::new();

        assert!(matches!(
            registry.register_object("X", 100, 2, 1),
            Err(Error::DefinitionInvalid)
        ));
        assert!(matches!(
            registry.register_object("X", 100, 0, 0xFFFF),
            Err(Error::DefinitionInvalid)
        ));
    }

    #[test]
    fn rejects_executable_with_value() {
        let mut registry = DefinitionRegistry::new();
        registry.register_object("X", 100, 0, 1).unwrap();

        assert!(matches!(
            registry.register_resource(
                100,
                1,
                "Run",
                ResourceType::Integer,
                0,
                1,
                ResourceOperations::Execute,
                None,
            ),
            Err(Error::DefinitionInvalid)
        ));

        assert!(
            registry
                .register_resource(
                    100,
                    1,
                    "Run",
                    ResourceType::None,
                    0,
                    1,
                    ResourceOperations::Execute,
                    None,
                )
                .is_ok()
        );
    }

    #[test]
    fn duplicate_leaves_existing_definition() {
        let mut registry = DefinitionRegistry::new();
        registry.register_object("First", 7, 0, 1).unwrap();

        assert!(matches!(
            registry.register_object("Second", 7, 0, 10),
            Err(Error::AlreadyDefined)
        ));

        let object = registry.lookup_object(7).unwrap();
        assert_eq!(object.name, "First");
        assert_eq!(object.max_instances, 1);
    }

    #[test]
    fn unknown_object_rejected() {
        let mut registry = DefinitionRegistry::new();

        assert!(matches!(
            registry.register_resource(
                9,
                0,
                "X",
                ResourceType::String,
                0,
                1,
                ResourceOperations::Read,
                None,
            ),
            Err(Error::NotDefined)
        ));
    }
}
