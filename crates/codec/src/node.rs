use bytes::Bytes;

use crate::value::ResourceType;

/// The level of the hierarchy a node sits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Object,
    ObjectInstance,
    Resource,
    ResourceInstance,
}

/// A detached slice of the object hierarchy.
///
/// Decoders produce these trees and the dispatcher grafts them into the
/// store atomically; building one never requires the addressed entities to
/// exist anywhere. A node owns its children. Leaves carry the raw value
/// bytes in the layouts defined by [`crate::value`]; resource-level nodes
/// carry the registered type so later permission and width checks do not
/// need to re-resolve the schema.
///
/// # Test
///
/// ```
/// use lwm2m_stack_codec::node::{Node, NodeKind};
///
/// let mut instance = Node::new(NodeKind::ObjectInstance, Some(0));
/// let resource = instance.add_child(Node::new(NodeKind::Resource, Some(1)));
/// resource.add_child(Node::with_value(NodeKind::ResourceInstance, Some(0), vec![0x05].into()));
///
/// assert_eq!(instance.children().count(), 1);
/// assert_eq!(
///     instance.child(1).unwrap().child(0).unwrap().value().unwrap().as_ref(),
///     &[0x05],
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Node {
    kind: NodeKind,
    id: Option<u16>,
    resource_type: Option<ResourceType>,
    children: Vec<Node>,
    value: Option<Bytes>,
    create: bool,
}

impl Node {
    pub fn new(kind: NodeKind, id: Option<u16>) -> Self {
        Self {
            kind,
            id,
            resource_type: None,
            children: Vec::new(),
            value: None,
            create: false,
        }
    }

    pub fn with_value(kind: NodeKind, id: Option<u16>, value: Bytes) -> Self {
        Self {
            value: Some(value),
            ..Self::new(kind, id)
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn set_id(&mut self, id: Option<u16>) {
        self.id = id;
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        self.resource_type
    }

    pub fn set_resource_type(&mut self, resource_type: ResourceType) {
        self.resource_type = Some(resource_type);
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Bytes) {
        self.value = Some(value);
    }

    /// Marks a tree that asks the dispatcher to create the addressed
    /// instance rather than update it.
    pub fn create_requested(&self) -> bool {
        self.create
    }

    pub fn request_create(&mut self) {
        self.create = true;
    }

    /// Attach a child, keeping children ordered ascending by id, and return
    /// a mutable reference to it. A child with the same id replaces the
    /// existing one.
    pub fn add_child(&mut self, child: Node) -> &mut Node {
        let index = match self
            .children
            .binary_search_by_key(&child.id, |it| it.id)
        {
            Ok(index) => {
                self.children[index] = child;
                index
            }
            Err(index) => {
                self.children.insert(index, child);
                index
            }
        };

        &mut self.children[index]
    }

    /// Return the child with this id, inserting an empty node of the given
    /// kind when absent.
    pub fn ensure_child(&mut self, kind: NodeKind, id: Option<u16>) -> &mut Node {
        match self.children.binary_search_by_key(&id, |it| it.id) {
            Ok(index) => &mut self.children[index],
            Err(index) => {
                self.children.insert(index, Node::new(kind, id));
                &mut self.children[index]
            }
        }
    }

    pub fn child(&self, id: u16) -> Option<&Node> {
        self.children
            .binary_search_by_key(&Some(id), |it| it.id)
            .ok()
            .map(|index| &self.children[index])
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.children.first()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
