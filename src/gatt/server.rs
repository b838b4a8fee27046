//! The local GATT server database
//!
//! A tree of services, characteristics and descriptors published to remote
//! clients by the peripheral-role side of a [`handler`](super::handler).
//! Handles are assigned in one pass at publication time; the per-connection
//! notification/indication configuration lives in each CCCD value and is
//! reset when the connection goes away.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Mutex, MutexGuard};

use super::{
    Properties,
    CLIENT_CHAR_CONFIG_TYPE,
    EXT_PROPERTIES_TYPE,
};
use crate::Uuid;

/// Server operating modes
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Mode {
    /// No database; every read and write is answered "attribute not found"
    Nop,
    /// Serve from the local database
    Db,
}

/// A server-side descriptor
///
/// The value is fixed-length unless `variable_length` was requested;
/// variable length is never allowed for the CCCD and Extended Properties
/// descriptors, those are forced to fixed.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct DbGattDesc {
    pub desc_type: Uuid,
    value: Vec<u8>,
    capacity: usize,
    variable_length: bool,
    /// Assigned by `set_handles`
    pub handle: u16,
}

impl DbGattDesc {
    pub fn new(desc_type: Uuid, value: Vec<u8>, variable_length: bool) -> Self {
        let fixed_only = desc_type == CLIENT_CHAR_CONFIG_TYPE || desc_type == EXT_PROPERTIES_TYPE;

        if fixed_only && variable_length {
            log::debug!("descriptor {} cannot be variable length, forcing fixed", desc_type);
        }

        let capacity = value.len();

        DbGattDesc {
            desc_type,
            value,
            capacity,
            variable_length: variable_length && !fixed_only,
            handle: 0,
        }
    }

    /// A zeroed Client Characteristic Configuration descriptor
    pub fn cccd() -> Self {
        Self::new(CLIENT_CHAR_CONFIG_TYPE, alloc::vec![0u8; 2], false)
    }

    /// A User Description descriptor with a fixed string value
    pub fn user_description(text: &str) -> Self {
        Self::new(super::USER_DESCRIPTION_TYPE, text.as_bytes().to_vec(), false)
    }

    pub fn value(&self) -> &[u8] { &self.value }

    pub fn is_variable_length(&self) -> bool { self.variable_length }

    pub fn is_cccd(&self) -> bool { self.desc_type == CLIENT_CHAR_CONFIG_TYPE }

    /// Replace the value
    ///
    /// Fixed-length values only accept their exact length; variable-length
    /// values accept anything up to the capacity.
    pub fn set_value(&mut self, value: &[u8]) -> bool {
        let acceptable = if self.variable_length {
            value.len() <= self.capacity
        } else {
            value.len() == self.value.len()
        };

        if acceptable {
            self.value.clear();
            self.value.extend_from_slice(value);
        }
        acceptable
    }

    /// Write at an offset without changing the length
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> bool {
        if offset + data.len() <= self.value.len() {
            self.value[offset..offset + data.len()].copy_from_slice(data);
            true
        } else if self.variable_length && offset + data.len() <= self.capacity {
            self.value.resize(offset + data.len(), 0);
            self.value[offset..offset + data.len()].copy_from_slice(data);
            true
        } else {
            false
        }
    }
}

/// A server-side characteristic
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct DbGattChar {
    pub char_type: Uuid,
    pub properties: Properties,
    value: Vec<u8>,
    capacity: usize,
    variable_length: bool,
    pub descriptors: Vec<DbGattDesc>,
    /// Assigned by `set_handles`
    pub declaration_handle: u16,
    /// Assigned by `set_handles`
    pub value_handle: u16,
}

impl DbGattChar {
    pub fn new(
        char_type: Uuid,
        properties: Properties,
        value: Vec<u8>,
        variable_length: bool,
    ) -> Self {
        let capacity = value.len();

        DbGattChar {
            char_type,
            properties,
            value,
            capacity,
            variable_length,
            descriptors: Vec::new(),
            declaration_handle: 0,
            value_handle: 0,
        }
    }

    /// Reserve `capacity` bytes for a variable-length value
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = self.capacity.max(capacity);
        self
    }

    pub fn with_descriptor(mut self, desc: DbGattDesc) -> Self {
        self.descriptors.push(desc);
        self
    }

    pub fn value(&self) -> &[u8] { &self.value }

    pub fn is_variable_length(&self) -> bool { self.variable_length }

    pub fn set_value(&mut self, value: &[u8]) -> bool {
        let acceptable = if self.variable_length {
            value.len() <= self.capacity
        } else {
            value.len() == self.value.len()
        };

        if acceptable {
            self.value.clear();
            self.value.extend_from_slice(value);
        }
        acceptable
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> bool {
        if offset + data.len() <= self.value.len() {
            self.value[offset..offset + data.len()].copy_from_slice(data);
            true
        } else if self.variable_length && offset + data.len() <= self.capacity {
            self.value.resize(offset + data.len(), 0);
            self.value[offset..offset + data.len()].copy_from_slice(data);
            true
        } else {
            false
        }
    }

    pub fn find_cccd(&self) -> Option<&DbGattDesc> {
        self.descriptors.iter().find(|d| d.is_cccd())
    }

    fn find_cccd_mut(&mut self) -> Option<&mut DbGattDesc> {
        self.descriptors.iter_mut().find(|d| d.is_cccd())
    }

    /// Notify/indicate enable bits of the CCCD value
    pub fn cccd_bits(&self) -> (bool, bool) {
        match self.find_cccd() {
            Some(d) if d.value().len() == 2 => {
                let bits = d.value()[0];
                (bits & 0x01 != 0, bits & 0x02 != 0)
            }
            _ => (false, false),
        }
    }
}

/// A server-side service
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct DbGattService {
    pub primary: bool,
    pub service_type: Uuid,
    pub characteristics: Vec<DbGattChar>,
    /// Assigned by `set_handles`
    pub handle: u16,
    /// Assigned by `set_handles`
    pub end_handle: u16,
}

impl DbGattService {
    pub fn new(primary: bool, service_type: Uuid) -> Self {
        DbGattService {
            primary,
            service_type,
            characteristics: Vec::new(),
            handle: 0,
            end_handle: 0,
        }
    }

    pub fn with_char(mut self, characteristic: DbGattChar) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Position of an attribute handle inside the database
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum AttributeRef {
    ServiceDeclaration { service: usize },
    CharDeclaration { service: usize, characteristic: usize },
    CharValue { service: usize, characteristic: usize },
    Descriptor { service: usize, characteristic: usize, descriptor: usize },
}

/// The handle-addressed service tree
///
/// Accessed under the [`DbGattServer`] lock; the request-processing reader
/// thread of a handler is the only writer during a connection.
#[derive(Debug,Default)]
pub struct GattDb {
    pub services: Vec<DbGattService>,
}

impl GattDb {
    /// Assign all handles in declaration order
    ///
    /// A single monotonically increasing counter starting at 1 assigns, per
    /// service: the service handle, then per characteristic the declaration
    /// handle, the value handle, then each descriptor handle. The service
    /// end handle is the last handle assigned within it. Returns the total
    /// number of handles assigned.
    pub fn set_handles(&mut self) -> u16 {
        let mut next: u16 = 1;

        for service in self.services.iter_mut() {
            service.handle = next;
            next += 1;

            for characteristic in service.characteristics.iter_mut() {
                characteristic.declaration_handle = next;
                next += 1;
                characteristic.value_handle = next;
                next += 1;

                for desc in characteristic.descriptors.iter_mut() {
                    desc.handle = next;
                    next += 1;
                }
            }

            service.end_handle = next - 1;
        }

        next - 1
    }

    pub fn find_service(&self, service_type: Uuid) -> Option<&DbGattService> {
        self.services.iter().find(|s| s.service_type == service_type)
    }

    pub fn find_char(&self, service_type: Uuid, char_type: Uuid) -> Option<&DbGattChar> {
        self.find_service(service_type)?
            .characteristics.iter().find(|c| c.char_type == char_type)
    }

    pub fn find_char_by_value_handle(&self, value_handle: u16) -> Option<&DbGattChar> {
        self.services.iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.value_handle == value_handle)
    }

    pub fn find_cccd(&self, service_type: Uuid, char_type: Uuid) -> Option<&DbGattDesc> {
        self.find_char(service_type, char_type)?.find_cccd()
    }

    /// Zero the CCCD value of one characteristic
    pub fn reset_cccd(&mut self, service_type: Uuid, char_type: Uuid) {
        let desc = self.services.iter_mut()
            .filter(|s| s.service_type == service_type)
            .flat_map(|s| s.characteristics.iter_mut())
            .filter(|c| c.char_type == char_type)
            .find_map(|c| c.find_cccd_mut());

        if let Some(desc) = desc {
            desc.set_value(&[0, 0]);
        }
    }

    /// Zero every CCCD, used when the serving connection goes away
    pub fn reset_all_cccd(&mut self) {
        for service in self.services.iter_mut() {
            for characteristic in service.characteristics.iter_mut() {
                if let Some(desc) = characteristic.find_cccd_mut() {
                    desc.set_value(&[0, 0]);
                }
            }
        }
    }

    /// Locate the attribute owning `handle`
    pub fn resolve_handle(&self, handle: u16) -> Option<AttributeRef> {
        if handle == 0 {
            return None;
        }

        for (si, service) in self.services.iter().enumerate() {
            if service.handle == handle {
                return Some(AttributeRef::ServiceDeclaration { service: si });
            }

            for (ci, characteristic) in service.characteristics.iter().enumerate() {
                if characteristic.declaration_handle == handle {
                    return Some(AttributeRef::CharDeclaration { service: si, characteristic: ci });
                }
                if characteristic.value_handle == handle {
                    return Some(AttributeRef::CharValue { service: si, characteristic: ci });
                }

                for (di, desc) in characteristic.descriptors.iter().enumerate() {
                    if desc.handle == handle {
                        return Some(AttributeRef::Descriptor {
                            service: si, characteristic: ci, descriptor: di,
                        });
                    }
                }
            }
        }

        None
    }
}

/// Listener for server database access by the remote client
///
/// The `read_*`/`write_*` callbacks authorize the access; any `false`
/// return rejects the request with the matching permission error. The
/// `*_done` and configuration callbacks report applied changes. All run on
/// the handler's reader thread.
pub trait DbGattServerListener: Send + Sync {
    fn read_char_value(&self, _service: &DbGattService, _characteristic: &DbGattChar) -> bool {
        true
    }

    fn read_desc_value(
        &self,
        _service: &DbGattService,
        _characteristic: &DbGattChar,
        _descriptor: &DbGattDesc,
    ) -> bool {
        true
    }

    fn write_char_value(
        &self,
        _service: &DbGattService,
        _characteristic: &DbGattChar,
        _value: &[u8],
        _offset: u16,
    ) -> bool {
        true
    }

    fn write_char_value_done(&self, _service: &DbGattService, _characteristic: &DbGattChar) {}

    fn write_desc_value(
        &self,
        _service: &DbGattService,
        _characteristic: &DbGattChar,
        _descriptor: &DbGattDesc,
        _value: &[u8],
        _offset: u16,
    ) -> bool {
        true
    }

    fn write_desc_value_done(
        &self,
        _service: &DbGattService,
        _characteristic: &DbGattChar,
        _descriptor: &DbGattDesc,
    ) {
    }

    /// The client rewrote a CCCD
    fn client_char_config_changed(
        &self,
        _service: &DbGattService,
        _characteristic: &DbGattChar,
        _descriptor: &DbGattDesc,
        _notify_enabled: bool,
        _indicate_enabled: bool,
    ) {
    }
}

/// The local GATT server
///
/// Owns the database and the listener registry. Listeners are identified by
/// their `Arc` address; the registry is deduplicated and keeps insertion
/// order. Fan-out iterates a snapshot, so mutating the registry during a
/// callback never skips or reorders running listeners.
pub struct DbGattServer {
    mode: Mode,
    db: Mutex<GattDb>,
    listeners: Mutex<Arc<Vec<Arc<dyn DbGattServerListener>>>>,
}

impl DbGattServer {
    pub fn new(mode: Mode) -> Self {
        DbGattServer {
            mode,
            db: Mutex::new(GattDb::default()),
            listeners: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn mode(&self) -> Mode { self.mode }

    /// Access the database under its lock
    pub fn db(&self) -> MutexGuard<'_, GattDb> {
        self.db.lock().unwrap()
    }

    /// Add a service and re-assign all handles
    pub fn add_service(&self, service: DbGattService) -> u16 {
        let mut db = self.db();

        db.services.push(service);
        db.set_handles()
    }

    /// Register a listener; duplicates (same `Arc`) are ignored
    pub fn add_listener(&self, listener: Arc<dyn DbGattServerListener>) -> bool {
        let mut guard = self.listeners.lock().unwrap();

        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }

        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Remove a listener by identity
    pub fn remove_listener(&self, listener: &Arc<dyn DbGattServerListener>) -> bool {
        let mut guard = self.listeners.lock().unwrap();

        let before = guard.len();
        let next: Vec<_> = guard.iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();

        if next.len() == before {
            return false;
        }

        *guard = Arc::new(next);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Snapshot of the listener list for fan-out
    pub fn listeners(&self) -> Arc<Vec<Arc<dyn DbGattServerListener>>> {
        self.listeners.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn two_service_db() -> GattDb {
        let mut db = GattDb::default();

        db.services.push(
            DbGattService::new(true, Uuid::from_u16(0x1800))
                .with_char(
                    DbGattChar::new(
                        Uuid::from_u16(0x2A00),
                        Properties::READ,
                        b"dev".to_vec(),
                        true,
                    )
                    .with_capacity(32),
                ),
        );
        db.services.push(
            DbGattService::new(true, Uuid::from_u16(0x180F))
                .with_char(
                    DbGattChar::new(
                        Uuid::from_u16(0x2A19),
                        Properties::READ | Properties::NOTIFY,
                        alloc::vec![100u8],
                        false,
                    )
                    .with_descriptor(DbGattDesc::cccd())
                    .with_descriptor(DbGattDesc::user_description("battery")),
                ),
        );
        db
    }

    #[test]
    fn handle_assignment_single_pass() {
        let mut db = two_service_db();

        let count = db.set_handles();

        // service 1: svc(1), decl(2), value(3)
        // service 2: svc(4), decl(5), value(6), cccd(7), user desc(8)
        assert_eq!(8, count);

        let s0 = &db.services[0];
        assert_eq!(1, s0.handle);
        assert_eq!(2, s0.characteristics[0].declaration_handle);
        assert_eq!(3, s0.characteristics[0].value_handle);
        assert_eq!(3, s0.end_handle);

        let s1 = &db.services[1];
        assert_eq!(4, s1.handle);
        assert_eq!(5, s1.characteristics[0].declaration_handle);
        assert_eq!(6, s1.characteristics[0].value_handle);
        assert_eq!(7, s1.characteristics[0].descriptors[0].handle);
        assert_eq!(8, s1.characteristics[0].descriptors[1].handle);
        assert_eq!(8, s1.end_handle);

        // dense contiguous ranges, ordered
        assert!(s0.handle <= s0.characteristics[0].declaration_handle);
        assert!(s0.characteristics[0].declaration_handle < s0.characteristics[0].value_handle);
        assert!(s1.characteristics[0].value_handle <= s1.characteristics[0].descriptors[0].handle);
        assert!(s1.characteristics[0].descriptors[1].handle <= s1.end_handle);
    }

    #[test]
    fn resolve_handles() {
        let mut db = two_service_db();
        db.set_handles();

        assert_eq!(Some(AttributeRef::ServiceDeclaration { service: 0 }), db.resolve_handle(1));
        assert_eq!(
            Some(AttributeRef::CharValue { service: 1, characteristic: 0 }),
            db.resolve_handle(6)
        );
        assert_eq!(
            Some(AttributeRef::Descriptor { service: 1, characteristic: 0, descriptor: 0 }),
            db.resolve_handle(7)
        );
        assert_eq!(None, db.resolve_handle(0));
        assert_eq!(None, db.resolve_handle(9));
    }

    #[test]
    fn cccd_is_fixed_two_bytes() {
        let desc = DbGattDesc::new(CLIENT_CHAR_CONFIG_TYPE, alloc::vec![0, 0], true);

        // variable length is forbidden for the CCCD
        assert!(!desc.is_variable_length());

        let mut desc = DbGattDesc::cccd();
        assert!(!desc.set_value(&[1]));
        assert!(!desc.set_value(&[1, 0, 0]));
        assert!(desc.set_value(&[1, 0]));
        assert_eq!(&[1, 0], desc.value());
    }

    #[test]
    fn reset_cccd_zeroes_value() {
        let mut db = two_service_db();
        db.set_handles();

        let svc = Uuid::from_u16(0x180F);
        let chr = Uuid::from_u16(0x2A19);

        db.services[1].characteristics[0]
            .find_cccd_mut().unwrap()
            .set_value(&[0x02, 0x00]);

        assert_eq!((false, true), db.services[1].characteristics[0].cccd_bits());

        db.reset_cccd(svc, chr);

        assert_eq!(&[0u8, 0u8], db.find_cccd(svc, chr).unwrap().value());
        assert_eq!((false, false), db.services[1].characteristics[0].cccd_bits());
    }

    #[test]
    fn listener_registry_identity_set() {
        struct Quiet;
        impl DbGattServerListener for Quiet {}

        let server = DbGattServer::new(Mode::Db);
        let l1: Arc<dyn DbGattServerListener> = Arc::new(Quiet);
        let l2: Arc<dyn DbGattServerListener> = Arc::new(Quiet);

        assert!(server.add_listener(l1.clone()));
        assert!(!server.add_listener(l1.clone()));
        assert!(server.add_listener(l2.clone()));
        assert_eq!(2, server.listener_count());

        assert!(server.remove_listener(&l1));
        assert!(!server.remove_listener(&l1));
        assert_eq!(1, server.listener_count());
    }

    #[test]
    fn variable_length_write_grows_within_capacity() {
        let mut c = DbGattChar::new(
            Uuid::from_u16(0x2A00),
            Properties::READ | Properties::WRITE_WITH_ACK,
            Vec::new(),
            true,
        )
        .with_capacity(8);

        assert!(c.write_at(0, b"abcd"));
        assert!(c.write_at(4, b"ef"));
        assert_eq!(b"abcdef", c.value());
        assert!(!c.write_at(4, b"too long!"));
    }
}
