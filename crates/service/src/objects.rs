//! The OMA standard objects every client session carries.
//!
//! Only the objects the protocol machinery itself reads are defined here:
//! Security (/0) and Server (/1) feed the bootstrap and registration
//! machines, Access Control (/2) feeds the permission checks, Device (/3)
//! is the mandatory introspection surface. Applications define their own
//! objects on top through the registry API.

use codec::{
    registry::{DefinitionRegistry, ResourceOperations},
    value::ResourceType,
};

use crate::Error;

pub mod security {
    pub const OBJECT_ID: u16 = 0;
    pub const SERVER_URI: u16 = 0;
    pub const BOOTSTRAP: u16 = 1;
    pub const SECURITY_MODE: u16 = 2;
    pub const PUBLIC_KEY: u16 = 3;
    pub const SERVER_PUBLIC_KEY: u16 = 4;
    pub const SECRET_KEY: u16 = 5;
    pub const SHORT_SERVER_ID: u16 = 10;
    pub const HOLD_OFF_TIME: u16 = 11;
}

pub mod server {
    pub const OBJECT_ID: u16 = 1;
    pub const SHORT_SERVER_ID: u16 = 0;
    pub const LIFETIME: u16 = 1;
    pub const DEFAULT_MINIMUM_PERIOD: u16 = 2;
    pub const DEFAULT_MAXIMUM_PERIOD: u16 = 3;
    pub const DISABLE: u16 = 4;
    pub const DISABLE_TIMEOUT: u16 = 5;
    pub const NOTIFICATION_STORING: u16 = 6;
    pub const BINDING: u16 = 7;
    pub const REGISTRATION_UPDATE_TRIGGER: u16 = 8;
}

pub mod access_control {
    pub const OBJECT_ID: u16 = 2;
    pub const TARGET_OBJECT_ID: u16 = 0;
    pub const TARGET_INSTANCE_ID: u16 = 1;
    pub const ACL: u16 = 2;
    pub const OWNER: u16 = 3;
}

pub mod device {
    pub const OBJECT_ID: u16 = 3;
    pub const MANUFACTURER: u16 = 0;
    pub const MODEL_NUMBER: u16 = 1;
    pub const SERIAL_NUMBER: u16 = 2;
    pub const FIRMWARE_VERSION: u16 = 3;
    pub const REBOOT: u16 = 4;
    pub const FACTORY_RESET: u16 = 5;
    pub const ERROR_CODE: u16 = 11;
    pub const CURRENT_TIME: u16 = 13;
    pub const UTC_OFFSET: u16 = 14;
    pub const TIMEZONE: u16 = 15;
    pub const SUPPORTED_BINDINGS: u16 = 16;
}

/// Register the standard definitions into a fresh registry.
pub fn register_standard_objects(registry: &mut DefinitionRegistry) -> Result<(), Error> {
    use ResourceOperations::{Execute, None as NoOps, Read, ReadWrite};
    use ResourceType::*;

    registry.register_object("LWM2MSecurity", security::OBJECT_ID, 0, 1000)?;
    for (id, name, resource_type, min, max) in [
        (security::SERVER_URI, "LWM2MServerURI", String, 1, 1),
        (security::BOOTSTRAP, "BootstrapServer", Boolean, 1, 1),
        (security::SECURITY_MODE, "SecurityMode", Integer, 1, 1),
        (security::PUBLIC_KEY, "PublicKeyorIDentity", Opaque, 1, 1),
        (security::SERVER_PUBLIC_KEY, "ServerPublicKey", Opaque, 1, 1),
        (security::SECRET_KEY, "SecretKey", Opaque, 1, 1),
        (security::SHORT_SERVER_ID, "ShortServerID", Integer, 0, 1),
        (security::HOLD_OFF_TIME, "ClientHoldOffTime", Integer, 0, 1),
    ] {
        // Security resources are never exposed to servers.
        registry.register_resource(
            security::OBJECT_ID,
            id,
            name,
            resource_type,
            min,
            max,
            NoOps,
            Option::None,
        )?;
    }

    registry.register_object("LWM2MServer", server::OBJECT_ID, 0, 1000)?;
    for (id, name, resource_type, min, max, operations) in [
        (server::SHORT_SERVER_ID, "ShortServerID", Integer, 1, 1, Read),
        (server::LIFETIME, "Lifetime", Integer, 1, 1, ReadWrite),
        (
            server::DEFAULT_MINIMUM_PERIOD,
            "DefaultMinimumPeriod",
            Integer,
            0,
            1,
            ReadWrite,
        ),
        (
            server::DEFAULT_MAXIMUM_PERIOD,
            "DefaultMaximumPeriod",
            Integer,
            0,
            1,
            ReadWrite,
        ),
        (server::DISABLE, "Disable", None, 0, 1, Execute),
        (
            server::DISABLE_TIMEOUT,
            "DisableTimeout",
            Integer,
            0,
            1,
            ReadWrite,
        ),
        (
            server::NOTIFICATION_STORING,
            "NotificationStoringWhenDisabledorOffline",
            Boolean,
            1,
            1,
            ReadWrite,
        ),
        (server::BINDING, "Binding", String, 1, 1, ReadWrite),
        (
            server::REGISTRATION_UPDATE_TRIGGER,
            "RegistrationUpdateTrigger",
            None,
            1,
            1,
            Execute,
        ),
    ] {
        registry.register_resource(
            server::OBJECT_ID,
            id,
            name,
            resource_type,
            min,
            max,
            operations,
            Option::None,
        )?;
    }

    registry.register_object("LWM2MAccessControl", access_control::OBJECT_ID, 0, 1000)?;
    registry.register_resource(
        access_control::OBJECT_ID,
        access_control::TARGET_OBJECT_ID,
        "ObjectID",
        Integer,
        1,
        1,
        Read,
        Option::None,
    )?;
    registry.register_resource(
        access_control::OBJECT_ID,
        access_control::TARGET_INSTANCE_ID,
        "ObjectInstanceID",
        Integer,
        1,
        1,
        Read,
        Option::None,
    )?;
    registry.register_resource(
        access_control::OBJECT_ID,
        access_control::ACL,
        "ACL",
        IntegerArray,
        0,
        1000,
        ReadWrite,
        Option::None,
    )?;
    registry.register_resource(
        access_control::OBJECT_ID,
        access_control::OWNER,
        "AccessControlOwner",
        Integer,
        1,
        1,
        ReadWrite,
        Option::None,
    )?;

    registry.register_object("Device", device::OBJECT_ID, 1, 1)?;
    for (id, name, resource_type, min, max, operations) in [
        (device::MANUFACTURER, "Manufacturer", String, 0, 1, Read),
        (device::MODEL_NUMBER, "ModelNumber", String, 0, 1, Read),
        (device::SERIAL_NUMBER, "SerialNumber", String, 0, 1, Read),
        (device::FIRMWARE_VERSION, "FirmwareVersion", String, 0, 1, Read),
        (device::REBOOT, "Reboot", None, 1, 1, Execute),
        (device::FACTORY_RESET, "FactoryReset", None, 0, 1, Execute),
        (device::ERROR_CODE, "ErrorCode", IntegerArray, 1, 1000, Read),
        (device::CURRENT_TIME, "CurrentTime", Time, 0, 1, ReadWrite),
        (device::UTC_OFFSET, "UTCOffset", String, 0, 1, ReadWrite),
        (device::TIMEZONE, "Timezone", String, 0, 1, ReadWrite),
        (
            device::SUPPORTED_BINDINGS,
            "SupportedBindingandModes",
            String,
            1,
            1,
            Read,
        ),
    ] {
        registry.register_resource(
            device::OBJECT_ID,
            id,
            name,
            resource_type,
            min,
            max,
            operations,
            Option::None,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_objects_register_cleanly() {
        let mut registry = DefinitionRegistry::new();
        register_standard_objects(&mut registry).unwrap();

        assert!(registry.lookup_object(0).is_some());
        assert!(registry.lookup_resource(1, server::LIFETIME).is_some());
        assert!(
            registry
                .lookup_resource(3, device::REBOOT)
                .unwrap()
                .operations
                .executable()
        );

        // A second registration attempt must not disturb the first.
        assert!(register_standard_objects(&mut registry).is_err());
        assert_eq!(registry.lookup_object(3).unwrap().name, "Device");
    }
}
