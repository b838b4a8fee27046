//! The Generic Attribute Profile
//!
//! The client-view GATT tree discovered from a remote server, the
//! characteristic listener interface, and the declaration UUIDs shared by
//! the [`handler`] and the local [`server`] database.
//!
//! Ownership runs strictly downward: a handler owns its services, a service
//! its characteristics, a characteristic its descriptors. Children refer
//! back to their parents by handle lookup only.

use alloc::vec::Vec;

use crate::Uuid;

pub mod handler;
pub mod server;

/// Primary Service declaration
pub const PRIMARY_SERVICE_TYPE: Uuid = Uuid::from_u16(0x2800);

/// Secondary Service declaration
pub const SECONDARY_SERVICE_TYPE: Uuid = Uuid::from_u16(0x2801);

/// Include declaration
pub const INCLUDE_TYPE: Uuid = Uuid::from_u16(0x2802);

/// Characteristic declaration
pub const CHARACTERISTIC_TYPE: Uuid = Uuid::from_u16(0x2803);

/// Characteristic Extended Properties descriptor
pub const EXT_PROPERTIES_TYPE: Uuid = Uuid::from_u16(0x2900);

/// Characteristic User Description descriptor
pub const USER_DESCRIPTION_TYPE: Uuid = Uuid::from_u16(0x2901);

/// Client Characteristic Configuration descriptor (CCCD)
pub const CLIENT_CHAR_CONFIG_TYPE: Uuid = Uuid::from_u16(0x2902);

bitflags::bitflags! {
    /// The properties bit field of a characteristic declaration
    pub struct Properties: u8 {
        const BROADCAST         = 0x01;
        const READ              = 0x02;
        const WRITE_NO_ACK      = 0x04;
        const WRITE_WITH_ACK    = 0x08;
        const NOTIFY            = 0x10;
        const INDICATE          = 0x20;
        const AUTH_SIGNED_WRITE = 0x40;
        const EXT_PROPS         = 0x80;
    }
}

/// The role this side of the ATT bearer plays
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum GattRole {
    /// Central side, driving discovery and requests
    Client,
    /// Peripheral side, answering requests from the local database
    Server,
}

/// A discovered characteristic descriptor
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct GattDescriptor {
    pub handle: u16,
    pub desc_type: Uuid,
    /// Cached value, filled by explicit reads
    pub value: Vec<u8>,
}

/// A discovered characteristic
///
/// `end_handle` is derived after discovery: the handle preceding the next
/// characteristic's declaration within the same service, or the service end
/// handle for the last one.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct GattCharacteristic {
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
    pub properties: Properties,
    pub char_type: Uuid,
    /// Cached value, filled by explicit reads
    pub value: Vec<u8>,
    pub descriptors: Vec<GattDescriptor>,
    /// Index of the CCCD in `descriptors`, if discovered
    pub cccd_index: Option<usize>,
    /// Index of the User Description in `descriptors`, if discovered
    pub user_description_index: Option<usize>,
    /// Shadows bit 0 of the CCCD value last written
    pub notify_enabled: bool,
    /// Shadows bit 1 of the CCCD value last written
    pub indicate_enabled: bool,
}

impl GattCharacteristic {
    pub fn cccd(&self) -> Option<&GattDescriptor> {
        self.cccd_index.map(|i| &self.descriptors[i])
    }

    pub fn user_description(&self) -> Option<&GattDescriptor> {
        self.user_description_index.map(|i| &self.descriptors[i])
    }

    pub fn find_descriptor(&self, desc_type: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.desc_type == desc_type)
    }
}

/// A discovered service
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct GattService {
    pub start_handle: u16,
    pub end_handle: u16,
    pub service_type: Uuid,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn find_char(&self, char_type: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.char_type == char_type)
    }

    pub fn find_char_by_value_handle(&self, value_handle: u16) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.value_handle == value_handle)
    }
}

/// Listener for characteristic value changes pushed by the remote server
///
/// One interface serves notifications and indications. Callbacks run on the
/// handler's reader thread and must return promptly; panics are caught,
/// logged, and do not stop the remaining listeners.
pub trait GattCharListener: Send + Sync {
    /// A Handle Value Notification arrived for `characteristic`
    fn notification_received(
        &self,
        service: &GattService,
        characteristic: &GattCharacteristic,
        value: &[u8],
    );

    /// A Handle Value Indication arrived for `characteristic`
    ///
    /// `confirmation_sent` tells whether the handler will answer with a
    /// Handle Value Confirmation after the listener round.
    fn indication_received(
        &self,
        service: &GattService,
        characteristic: &GattCharacteristic,
        value: &[u8],
        confirmation_sent: bool,
    );
}
