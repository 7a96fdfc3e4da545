//! The endpoint table and the request-to-operation mapping of the
//! dispatcher.
//!
//! CoAP gives us a method, a path, a query and two content-format options;
//! LwM2M turns those into one of nine operations depending on the request
//! level and the registered schema. The response-code mapping at the
//! bottom is the single place protocol errors become CoAP codes.

use codec::{
    ContentFormat,
    coap::{Code, Message},
    path::Path,
    registry::DefinitionRegistry,
};

use crate::{Error, attributes::NotificationAttributes};

/// What a path prefix is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// `POST /bs`: bootstrap finish.
    BootstrapFinish,
    /// An object root on the client side.
    Object,
    /// `POST /rd`: the registration collection on the server side.
    Registration,
    /// `/rd/<location>`: one registration.
    RegistrationLocation,
}

/// Maps a path prefix to its handler kind, longest prefix first.
#[derive(Debug, Default)]
pub struct EndpointTable {
    entries: Vec<(String, EndpointKind)>,
}

impl EndpointTable {
    pub fn insert(&mut self, prefix: impl Into<String>, kind: EndpointKind) {
        let prefix = prefix.into();
        let index = self
            .entries
            .partition_point(|(existing, _)| existing.len() >= prefix.len());

        self.entries.insert(index, (prefix, kind));
    }

    pub fn lookup(&self, path: &str) -> Option<EndpointKind> {
        self.entries
            .iter()
            .find(|(prefix, _)| {
                path == prefix || path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                    rest.starts_with('/')
                })
            })
            .map(|(_, kind)| *kind)
    }
}

/// One LwM2M operation, resolved from method, level, options and schema.
#[derive(Debug, Clone)]
pub enum Operation {
    Read,
    Observe,
    CancelObserve,
    Discover,
    Write { replace: bool },
    WriteAttributes(NotificationAttributes, bool),
    Execute,
    Create,
    Delete,
}

/// Map a CoAP request to an operation, per the Device Management and
/// Information Reporting interfaces.
pub fn operation_for(
    message: &Message,
    path: &Path,
    registry: &DefinitionRegistry,
) -> Result<Operation, Error> {
    let attribute_query = || -> Result<Option<(NotificationAttributes, bool)>, Error> {
        let query = message.uri_query();
        if query.is_empty() {
            return Ok(None);
        }

        if query.iter().any(|entry| {
            entry == "cancel"
                || ["pmin", "pmax", "gt", "lt", "st"]
                    .iter()
                    .any(|name| entry.starts_with(&format!("{name}=")))
        }) {
            let (attributes, cancel) = NotificationAttributes::parse_query(&query)?;
            return Ok(Some((attributes, cancel)));
        }

        Ok(None)
    };

    Ok(match message.code {
        Code::Get => {
            if message.accept() == Some(ContentFormat::LinkFormat.into()) {
                Operation::Discover
            } else {
                match message.observe() {
                    Some(0) => Operation::Observe,
                    Some(1) => Operation::CancelObserve,
                    _ => Operation::Read,
                }
            }
        }
        Code::Put => match attribute_query()? {
            Some((attributes, cancel)) => Operation::WriteAttributes(attributes, cancel),
            None => Operation::Write { replace: true },
        },
        Code::Post => match path.depth() {
            1 => Operation::Create,
            3 => {
                let executable = path
                    .resource_id()
                    .and_then(|id| registry.lookup_resource(path.object_id(), id))
                    .map(|it| it.operations.executable())
                    .unwrap_or(false);

                if executable {
                    Operation::Execute
                } else {
                    Operation::Write { replace: false }
                }
            }
            _ => Operation::Write { replace: false },
        },
        Code::Delete => Operation::Delete,
        _ => return Err(Error::OperationNotPermitted),
    })
}

/// The mandatory outcome-to-code table.
pub fn error_code(error: &Error) -> Code {
    match error {
        Error::PathInvalid | Error::NotFound | Error::NotDefined => Code::NotFound,
        Error::Unauthorized => Code::Unauthorized,
        Error::OperationNotPermitted | Error::CannotDelete => Code::MethodNotAllowed,
        Error::TypeMismatch
        | Error::DecodeError
        | Error::CannotCreate
        | Error::AlreadyDefined
        | Error::DefinitionInvalid => Code::BadRequest,
        Error::CodecNotFound => Code::UnsupportedContentFormat,
        Error::Timeout | Error::TransportError | Error::Internal => Code::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::coap::MessageType;

    #[test]
    fn longest_prefix_wins() {
        let mut table = EndpointTable::default();
        table.insert("/rd", EndpointKind::Registration);
        table.insert("/rd/1", EndpointKind::RegistrationLocation);
        table.insert("/3", EndpointKind::Object);

        assert_eq!(table.lookup("/rd"), Some(EndpointKind::Registration));
        assert_eq!(
            table.lookup("/rd/1"),
            Some(EndpointKind::RegistrationLocation)
        );
        assert_eq!(table.lookup("/3/0/0"), Some(EndpointKind::Object));
        assert_eq!(table.lookup("/30"), None);
        assert_eq!(table.lookup("/4"), None);
    }

    #[test]
    fn get_variants() {
        let registry = DefinitionRegistry::new();
        let path: Path = "/3/0".parse().unwrap();

        let mut message = Message::new(MessageType::Confirmable, Code::Get, 1);
        assert!(matches!(
            operation_for(&message, &path, &registry),
            Ok(Operation::Read)
        ));

        message.set_observe(0);
        assert!(matches!(
            operation_for(&message, &path, &registry),
            Ok(Operation::Observe)
        ));

        let mut message = Message::new(MessageType::Confirmable, Code::Get, 1);
        message.set_accept(ContentFormat::LinkFormat.into());
        assert!(matches!(
            operation_for(&message, &path, &registry),
            Ok(Operation::Discover)
        ));
    }

    #[test]
    fn put_with_attribute_query_is_write_attributes() {
        let registry = DefinitionRegistry::new();
        let path: Path = "/3/0/15".parse().unwrap();

        let mut message = Message::new(MessageType::Confirmable, Code::Put, 1);
        message.add_uri_query("pmin=5");
        message.add_uri_query("pmax=60");

        match operation_for(&message, &path, &registry) {
            Ok(Operation::WriteAttributes(attributes, false)) => {
                assert_eq!(attributes.pmin, Some(5));
                assert_eq!(attributes.pmax, Some(60));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
