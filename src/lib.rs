//! A Bluetooth host stack over the Linux kernel's Bluetooth subsystem
//!
//! This crate talks to the kernel directly through raw HCI, L2CAP, and
//! management (mgmt) control sockets. No userspace daemon sits in between.
//!
//! The stack is layered bottom-up as follows
//! * [`buffer`] - the owned little-endian byte buffer every PDU is framed in
//! * [`att`] - the Attribute Protocol PDU codec
//! * [`l2cap`] / [`hci`] - the kernel socket transports
//! * [`gatt`] - the Generic Attribute Profile client/server engine
//! * [`mgmt`] - the kernel management channel codec and dispatcher
//! * [`eir`] - advertising/EIR data parsing
//!
//! Readers of the socket-bearing components each run on a dedicated OS
//! thread; application calls are blocking request/reply round trips.

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod ring;
pub mod sock;
pub mod att;
pub mod l2cap;
pub mod hci;
pub mod gatt;
pub mod mgmt;
pub mod eir;

/// The Bluetooth base UUID
///
/// 16 and 32 bit UUID shorthands are an offset into the third group of this
/// UUID, `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000000000001000800000805F9B34FB;

/// A Bluetooth UUID
///
/// All UUIDs are stored in their full 128 bit form. UUIDs created from the
/// 16 or 32 bit shorthands used by the Bluetooth assigned numbers are
/// expanded against [`BLUETOOTH_BASE_UUID`], and can be converted back with
/// the `TryFrom` implementations as long as the value still lies within the
/// base UUID range.
#[derive(Clone,Copy,Debug,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct Uuid {
    base_uuid: u128,
}

impl Uuid {
    pub const fn from_u16(v: u16) -> Self {
        Uuid { base_uuid: ((v as u128) << 96) | BLUETOOTH_BASE_UUID }
    }

    pub const fn from_u32(v: u32) -> Self {
        Uuid { base_uuid: ((v as u128) << 96) | BLUETOOTH_BASE_UUID }
    }

    pub const fn from_u128(v: u128) -> Self {
        Uuid { base_uuid: v }
    }

    pub fn as_u128(&self) -> u128 {
        self.base_uuid
    }

    /// Check if this UUID can be represented as a 16 bit shorthand
    pub fn is_16_bit(&self) -> bool {
        (self.base_uuid & !(0xFFFFu128 << 96)) == BLUETOOTH_BASE_UUID &&
        (self.base_uuid >> 96) <= 0xFFFF
    }

    /// Check if this UUID can be represented as a 32 bit shorthand
    pub fn is_32_bit(&self) -> bool {
        (self.base_uuid & !(0xFFFF_FFFFu128 << 96)) == BLUETOOTH_BASE_UUID
    }
}

impl From<u16> for Uuid {
    fn from(v: u16) -> Uuid { Uuid::from_u16(v) }
}

impl From<u32> for Uuid {
    fn from(v: u32) -> Uuid { Uuid::from_u32(v) }
}

impl From<u128> for Uuid {
    fn from(v: u128) -> Uuid { Uuid::from_u128(v) }
}

impl core::convert::TryFrom<Uuid> for u16 {
    type Error = ();

    /// Fails when the UUID is not a 16 bit shorthand of the base UUID
    fn try_from(uuid: Uuid) -> Result<u16, ()> {
        if uuid.is_16_bit() {
            Ok((uuid.base_uuid >> 96) as u16)
        } else {
            Err(())
        }
    }
}

impl core::convert::TryFrom<Uuid> for u32 {
    type Error = ();

    fn try_from(uuid: Uuid) -> Result<u32, ()> {
        if uuid.is_32_bit() {
            Ok((uuid.base_uuid >> 96) as u32)
        } else {
            Err(())
        }
    }
}

impl From<Uuid> for u128 {
    fn from(uuid: Uuid) -> u128 { uuid.base_uuid }
}

impl core::fmt::Display for Uuid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        use core::convert::TryFrom;

        if let Ok(v16) = <u16>::try_from(*self) {
            write!(f, "{:#06x}", v16)
        } else {
            let v = self.base_uuid;
            write!(f, "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                v as u64 & 0xFFFF_FFFF_FFFF)
        }
    }
}

/// A Bluetooth device address
///
/// Addresses are kept in the little-endian order they appear on the wire.
pub type BluetoothDeviceAddress = [u8; 6];

/// Format a device address the conventional way, most significant byte first
pub fn bluetooth_address_string(addr: &BluetoothDeviceAddress) -> alloc::string::String {
    alloc::format!("{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        addr[5], addr[4], addr[3], addr[2], addr[1], addr[0])
}

#[cfg(test)]
mod test {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn uuid_16_bit_round_trip() {
        let uuid = Uuid::from_u16(0x2800);

        assert!(uuid.is_16_bit());
        assert!(uuid.is_32_bit());
        assert_eq!(Ok(0x2800u16), <u16>::try_from(uuid));
        assert_eq!(0x0000_2800_0000_1000_8000_00805F9B34FB, uuid.as_u128());
    }

    #[test]
    fn uuid_128_bit_no_short_form() {
        let uuid = Uuid::from_u128(0x1234_5678_9ABC_DEF0_1234_5678_9ABC_DEF0);

        assert!(!uuid.is_16_bit());
        assert!(!uuid.is_32_bit());
        assert!(<u16>::try_from(uuid).is_err());
        assert!(<u32>::try_from(uuid).is_err());
    }

    #[test]
    fn address_formatting() {
        let addr: BluetoothDeviceAddress = [0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00];

        assert_eq!("00:80:5F:9B:34:FB", bluetooth_address_string(&addr));
    }
}
