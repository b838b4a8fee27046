//! The kernel Bluetooth management protocol
//!
//! Commands and events of the mgmt control channel, framed as
//! `{opcode:u16, dev_id:u16, param_len:u16, param[param_len]}`, all little
//! endian. The [`manager`] submodule drives this codec over the control
//! socket; this module is pure codec.

pub mod manager;

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryFrom;

use crate::buffer::{self, Octets};
use crate::BluetoothDeviceAddress;

pub const MGMT_HEADER_SIZE: usize = 6;

/// `dev_id` meaning "no adapter", used by version and index-list queries
pub const DEV_ID_NONE: u16 = 0xFFFF;

/// Maximum length of the adapter name in mgmt frames, including NUL
pub const MAX_NAME_LENGTH: usize = 249;

/// Maximum length of the adapter short name in mgmt frames, including NUL
pub const MAX_SHORT_NAME_LENGTH: usize = 11;

/// Errors of the mgmt codec and dispatcher
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum Error {
    /// A frame is shorter than its declared minimum
    InvalidPdu { what: &'static str, min: usize, actual: usize },
    /// A field was accessed outside the frame
    Bounds(buffer::Error),
    /// No matching reply within the deadline
    Timeout,
    /// The dispatcher is closed
    NotConnected,
    /// The control socket failed
    IoError,
    /// The kernel answered a command with a non-success status
    Status(MgmtStatus),
    /// An operation referenced an adapter that is not present
    InvalidIndex(u16),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::InvalidPdu { what, min, actual } =>
                write!(f, "invalid mgmt PDU: {} needs {} bytes, got {}", what, min, actual),
            Error::Bounds(e) => write!(f, "{}", e),
            Error::Timeout => write!(f, "mgmt command timeout"),
            Error::NotConnected => write!(f, "disconnected"),
            Error::IoError => write!(f, "io error"),
            Error::Status(s) => write!(f, "mgmt status: {}", s),
            Error::InvalidIndex(dev_id) => write!(f, "invalid index {}", dev_id),
        }
    }
}

impl From<buffer::Error> for Error {
    fn from(e: buffer::Error) -> Error {
        Error::Bounds(e)
    }
}

/// Status byte of CMD_COMPLETE and CMD_STATUS events
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum MgmtStatus {
    Success,
    UnknownCommand,
    NotConnected,
    Failed,
    ConnectFailed,
    AuthFailed,
    NotPaired,
    NoResources,
    Timeout,
    AlreadyConnected,
    Busy,
    Rejected,
    NotSupported,
    InvalidParams,
    Disconnected,
    NotPowered,
    Cancelled,
    InvalidIndex,
    RfKilled,
    AlreadyPaired,
    PermissionDenied,
    Unknown(u8),
}

impl MgmtStatus {
    pub fn from_raw(val: u8) -> MgmtStatus {
        match val {
            0x00 => MgmtStatus::Success,
            0x01 => MgmtStatus::UnknownCommand,
            0x02 => MgmtStatus::NotConnected,
            0x03 => MgmtStatus::Failed,
            0x04 => MgmtStatus::ConnectFailed,
            0x05 => MgmtStatus::AuthFailed,
            0x06 => MgmtStatus::NotPaired,
            0x07 => MgmtStatus::NoResources,
            0x08 => MgmtStatus::Timeout,
            0x09 => MgmtStatus::AlreadyConnected,
            0x0A => MgmtStatus::Busy,
            0x0B => MgmtStatus::Rejected,
            0x0C => MgmtStatus::NotSupported,
            0x0D => MgmtStatus::InvalidParams,
            0x0E => MgmtStatus::Disconnected,
            0x0F => MgmtStatus::NotPowered,
            0x10 => MgmtStatus::Cancelled,
            0x11 => MgmtStatus::InvalidIndex,
            0x12 => MgmtStatus::RfKilled,
            0x13 => MgmtStatus::AlreadyPaired,
            0x14 => MgmtStatus::PermissionDenied,
            other => MgmtStatus::Unknown(other),
        }
    }
}

impl core::fmt::Display for MgmtStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            MgmtStatus::Success => write!(f, "success"),
            MgmtStatus::UnknownCommand => write!(f, "unknown command"),
            MgmtStatus::NotConnected => write!(f, "not connected"),
            MgmtStatus::Failed => write!(f, "failed"),
            MgmtStatus::ConnectFailed => write!(f, "connect failed"),
            MgmtStatus::AuthFailed => write!(f, "authentication failed"),
            MgmtStatus::NotPaired => write!(f, "not paired"),
            MgmtStatus::NoResources => write!(f, "no resources"),
            MgmtStatus::Timeout => write!(f, "timeout"),
            MgmtStatus::AlreadyConnected => write!(f, "already connected"),
            MgmtStatus::Busy => write!(f, "busy"),
            MgmtStatus::Rejected => write!(f, "rejected"),
            MgmtStatus::NotSupported => write!(f, "not supported"),
            MgmtStatus::InvalidParams => write!(f, "invalid parameters"),
            MgmtStatus::Disconnected => write!(f, "disconnected"),
            MgmtStatus::NotPowered => write!(f, "not powered"),
            MgmtStatus::Cancelled => write!(f, "cancelled"),
            MgmtStatus::InvalidIndex => write!(f, "invalid index"),
            MgmtStatus::RfKilled => write!(f, "rf-killed"),
            MgmtStatus::AlreadyPaired => write!(f, "already paired"),
            MgmtStatus::PermissionDenied => write!(f, "permission denied"),
            MgmtStatus::Unknown(v) => write!(f, "unknown status {:#x}", v),
        }
    }
}

bitflags::bitflags! {
    /// Adapter settings bitset of READ_INFO and NEW_SETTINGS
    pub struct AdapterSetting: u32 {
        const POWERED           = 0x0000_0001;
        const CONNECTABLE       = 0x0000_0002;
        const FAST_CONNECTABLE  = 0x0000_0004;
        const DISCOVERABLE      = 0x0000_0008;
        const BONDABLE          = 0x0000_0010;
        const LINK_SECURITY     = 0x0000_0020;
        const SSP               = 0x0000_0040;
        const BREDR             = 0x0000_0080;
        const HS                = 0x0000_0100;
        const LE                = 0x0000_0200;
        const ADVERTISING       = 0x0000_0400;
        const SECURE_CONN       = 0x0000_0800;
        const DEBUG_KEYS        = 0x0000_1000;
        const PRIVACY           = 0x0000_2000;
        const CONFIGURATION     = 0x0000_4000;
        const STATIC_ADDRESS    = 0x0000_8000;
        const PHY_CONFIGURATION = 0x0001_0000;
    }
}

/// Requested controller mode when initializing an adapter
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum BtMode {
    Dual,
    BrEdr,
    Le,
}

/// Mgmt command opcodes with the kernel's numeric values
#[derive(Clone,Copy,Debug,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub enum MgmtCommandOpcode {
    ReadVersion,
    ReadIndexList,
    ReadInfo,
    SetPowered,
    SetDiscoverable,
    SetConnectable,
    SetFastConnectable,
    SetBondable,
    SetLinkSecurity,
    SetSsp,
    SetLe,
    SetLocalName,
    LoadLinkKeys,
    LoadLongTermKeys,
    Disconnect,
    PinCodeReply,
    PinCodeNegReply,
    PairDevice,
    CancelPairDevice,
    UnpairDevice,
    UserConfirmReply,
    UserConfirmNegReply,
    UserPasskeyReply,
    UserPasskeyNegReply,
    StartDiscovery,
    StopDiscovery,
    SetAdvertising,
    SetBredr,
    SetSecureConn,
    SetPrivacy,
    LoadIrks,
    GetConnInfo,
    AddDeviceWhitelist,
    RemoveDeviceWhitelist,
    LoadConnParam,
}

impl From<MgmtCommandOpcode> for u16 {
    fn from(op: MgmtCommandOpcode) -> u16 {
        match op {
            MgmtCommandOpcode::ReadVersion => 0x0001,
            MgmtCommandOpcode::ReadIndexList => 0x0003,
            MgmtCommandOpcode::ReadInfo => 0x0004,
            MgmtCommandOpcode::SetPowered => 0x0005,
            MgmtCommandOpcode::SetDiscoverable => 0x0006,
            MgmtCommandOpcode::SetConnectable => 0x0007,
            MgmtCommandOpcode::SetFastConnectable => 0x0008,
            MgmtCommandOpcode::SetBondable => 0x0009,
            MgmtCommandOpcode::SetLinkSecurity => 0x000A,
            MgmtCommandOpcode::SetSsp => 0x000B,
            MgmtCommandOpcode::SetLe => 0x000D,
            MgmtCommandOpcode::SetLocalName => 0x000F,
            MgmtCommandOpcode::LoadLinkKeys => 0x0012,
            MgmtCommandOpcode::LoadLongTermKeys => 0x0013,
            MgmtCommandOpcode::Disconnect => 0x0014,
            MgmtCommandOpcode::PinCodeReply => 0x0016,
            MgmtCommandOpcode::PinCodeNegReply => 0x0017,
            MgmtCommandOpcode::PairDevice => 0x0019,
            MgmtCommandOpcode::CancelPairDevice => 0x001A,
            MgmtCommandOpcode::UnpairDevice => 0x001B,
            MgmtCommandOpcode::UserConfirmReply => 0x001C,
            MgmtCommandOpcode::UserConfirmNegReply => 0x001D,
            MgmtCommandOpcode::UserPasskeyReply => 0x001E,
            MgmtCommandOpcode::UserPasskeyNegReply => 0x001F,
            MgmtCommandOpcode::StartDiscovery => 0x0023,
            MgmtCommandOpcode::StopDiscovery => 0x0024,
            MgmtCommandOpcode::SetAdvertising => 0x0029,
            MgmtCommandOpcode::SetBredr => 0x002A,
            MgmtCommandOpcode::SetSecureConn => 0x002D,
            MgmtCommandOpcode::SetPrivacy => 0x002F,
            MgmtCommandOpcode::LoadIrks => 0x0030,
            MgmtCommandOpcode::GetConnInfo => 0x0031,
            MgmtCommandOpcode::AddDeviceWhitelist => 0x0033,
            MgmtCommandOpcode::RemoveDeviceWhitelist => 0x0034,
            MgmtCommandOpcode::LoadConnParam => 0x0035,
        }
    }
}

impl TryFrom<u16> for MgmtCommandOpcode {
    type Error = ();

    fn try_from(val: u16) -> Result<Self, ()> {
        match val {
            0x0001 => Ok(MgmtCommandOpcode::ReadVersion),
            0x0003 => Ok(MgmtCommandOpcode::ReadIndexList),
            0x0004 => Ok(MgmtCommandOpcode::ReadInfo),
            0x0005 => Ok(MgmtCommandOpcode::SetPowered),
            0x0006 => Ok(MgmtCommandOpcode::SetDiscoverable),
            0x0007 => Ok(MgmtCommandOpcode::SetConnectable),
            0x0008 => Ok(MgmtCommandOpcode::SetFastConnectable),
            0x0009 => Ok(MgmtCommandOpcode::SetBondable),
            0x000A => Ok(MgmtCommandOpcode::SetLinkSecurity),
            0x000B => Ok(MgmtCommandOpcode::SetSsp),
            0x000D => Ok(MgmtCommandOpcode::SetLe),
            0x000F => Ok(MgmtCommandOpcode::SetLocalName),
            0x0012 => Ok(MgmtCommandOpcode::LoadLinkKeys),
            0x0013 => Ok(MgmtCommandOpcode::LoadLongTermKeys),
            0x0014 => Ok(MgmtCommandOpcode::Disconnect),
            0x0016 => Ok(MgmtCommandOpcode::PinCodeReply),
            0x0017 => Ok(MgmtCommandOpcode::PinCodeNegReply),
            0x0019 => Ok(MgmtCommandOpcode::PairDevice),
            0x001A => Ok(MgmtCommandOpcode::CancelPairDevice),
            0x001B => Ok(MgmtCommandOpcode::UnpairDevice),
            0x001C => Ok(MgmtCommandOpcode::UserConfirmReply),
            0x001D => Ok(MgmtCommandOpcode::UserConfirmNegReply),
            0x001E => Ok(MgmtCommandOpcode::UserPasskeyReply),
            0x001F => Ok(MgmtCommandOpcode::UserPasskeyNegReply),
            0x0023 => Ok(MgmtCommandOpcode::StartDiscovery),
            0x0024 => Ok(MgmtCommandOpcode::StopDiscovery),
            0x0029 => Ok(MgmtCommandOpcode::SetAdvertising),
            0x002A => Ok(MgmtCommandOpcode::SetBredr),
            0x002D => Ok(MgmtCommandOpcode::SetSecureConn),
            0x002F => Ok(MgmtCommandOpcode::SetPrivacy),
            0x0030 => Ok(MgmtCommandOpcode::LoadIrks),
            0x0031 => Ok(MgmtCommandOpcode::GetConnInfo),
            0x0033 => Ok(MgmtCommandOpcode::AddDeviceWhitelist),
            0x0034 => Ok(MgmtCommandOpcode::RemoveDeviceWhitelist),
            0x0035 => Ok(MgmtCommandOpcode::LoadConnParam),
            _ => Err(()),
        }
    }
}

/// Mgmt event opcodes with the kernel's numeric values
#[derive(Clone,Copy,Debug,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub enum MgmtEventOpcode {
    CmdComplete,
    CmdStatus,
    ControllerError,
    IndexAdded,
    IndexRemoved,
    NewSettings,
    ClassOfDevChanged,
    LocalNameChanged,
    NewLinkKey,
    NewLongTermKey,
    DeviceConnected,
    DeviceDisconnected,
    ConnectFailed,
    PinCodeRequest,
    UserConfirmRequest,
    UserPasskeyRequest,
    AuthFailed,
    DeviceFound,
    Discovering,
    DeviceBlocked,
    DeviceUnblocked,
    DeviceUnpaired,
    PasskeyNotify,
    NewIrk,
    NewCsrk,
    DeviceWhitelistAdded,
    DeviceWhitelistRemoved,
    NewConnParam,
}

impl From<MgmtEventOpcode> for u16 {
    fn from(op: MgmtEventOpcode) -> u16 {
        match op {
            MgmtEventOpcode::CmdComplete => 0x0001,
            MgmtEventOpcode::CmdStatus => 0x0002,
            MgmtEventOpcode::ControllerError => 0x0003,
            MgmtEventOpcode::IndexAdded => 0x0004,
            MgmtEventOpcode::IndexRemoved => 0x0005,
            MgmtEventOpcode::NewSettings => 0x0006,
            MgmtEventOpcode::ClassOfDevChanged => 0x0007,
            MgmtEventOpcode::LocalNameChanged => 0x0008,
            MgmtEventOpcode::NewLinkKey => 0x0009,
            MgmtEventOpcode::NewLongTermKey => 0x000A,
            MgmtEventOpcode::DeviceConnected => 0x000B,
            MgmtEventOpcode::DeviceDisconnected => 0x000C,
            MgmtEventOpcode::ConnectFailed => 0x000D,
            MgmtEventOpcode::PinCodeRequest => 0x000E,
            MgmtEventOpcode::UserConfirmRequest => 0x000F,
            MgmtEventOpcode::UserPasskeyRequest => 0x0010,
            MgmtEventOpcode::AuthFailed => 0x0011,
            MgmtEventOpcode::DeviceFound => 0x0012,
            MgmtEventOpcode::Discovering => 0x0013,
            MgmtEventOpcode::DeviceBlocked => 0x0014,
            MgmtEventOpcode::DeviceUnblocked => 0x0015,
            MgmtEventOpcode::DeviceUnpaired => 0x0016,
            MgmtEventOpcode::PasskeyNotify => 0x0017,
            MgmtEventOpcode::NewIrk => 0x0018,
            MgmtEventOpcode::NewCsrk => 0x0019,
            MgmtEventOpcode::DeviceWhitelistAdded => 0x001A,
            MgmtEventOpcode::DeviceWhitelistRemoved => 0x001B,
            MgmtEventOpcode::NewConnParam => 0x001C,
        }
    }
}

impl TryFrom<u16> for MgmtEventOpcode {
    type Error = ();

    fn try_from(val: u16) -> Result<Self, ()> {
        match val {
            0x0001 => Ok(MgmtEventOpcode::CmdComplete),
            0x0002 => Ok(MgmtEventOpcode::CmdStatus),
            0x0003 => Ok(MgmtEventOpcode::ControllerError),
            0x0004 => Ok(MgmtEventOpcode::IndexAdded),
            0x0005 => Ok(MgmtEventOpcode::IndexRemoved),
            0x0006 => Ok(MgmtEventOpcode::NewSettings),
            0x0007 => Ok(MgmtEventOpcode::ClassOfDevChanged),
            0x0008 => Ok(MgmtEventOpcode::LocalNameChanged),
            0x0009 => Ok(MgmtEventOpcode::NewLinkKey),
            0x000A => Ok(MgmtEventOpcode::NewLongTermKey),
            0x000B => Ok(MgmtEventOpcode::DeviceConnected),
            0x000C => Ok(MgmtEventOpcode::DeviceDisconnected),
            0x000D => Ok(MgmtEventOpcode::ConnectFailed),
            0x000E => Ok(MgmtEventOpcode::PinCodeRequest),
            0x000F => Ok(MgmtEventOpcode::UserConfirmRequest),
            0x0010 => Ok(MgmtEventOpcode::UserPasskeyRequest),
            0x0011 => Ok(MgmtEventOpcode::AuthFailed),
            0x0012 => Ok(MgmtEventOpcode::DeviceFound),
            0x0013 => Ok(MgmtEventOpcode::Discovering),
            0x0014 => Ok(MgmtEventOpcode::DeviceBlocked),
            0x0015 => Ok(MgmtEventOpcode::DeviceUnblocked),
            0x0016 => Ok(MgmtEventOpcode::DeviceUnpaired),
            0x0017 => Ok(MgmtEventOpcode::PasskeyNotify),
            0x0018 => Ok(MgmtEventOpcode::NewIrk),
            0x0019 => Ok(MgmtEventOpcode::NewCsrk),
            0x001A => Ok(MgmtEventOpcode::DeviceWhitelistAdded),
            0x001B => Ok(MgmtEventOpcode::DeviceWhitelistRemoved),
            0x001C => Ok(MgmtEventOpcode::NewConnParam),
            _ => Err(()),
        }
    }
}

fn write_header(frame: &mut Octets, opcode: u16, dev_id: u16, param_len: usize) {
    frame.put_u16(0, opcode).unwrap();
    frame.put_u16(2, dev_id).unwrap();
    frame.put_u16(4, param_len as u16).unwrap();
}

fn put_nul_string(frame: &mut Octets, offset: usize, text: &str, field_len: usize) {
    let bytes = text.as_bytes();
    let take = bytes.len().min(field_len - 1);

    frame.put_slice(offset, &bytes[..take]).unwrap();
    // The remainder of the field stays zeroed
}

fn read_nul_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// A link key record as carried by LOAD_LINK_KEYS and NEW_LINK_KEY
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct LinkKeyInfo {
    pub address: BluetoothDeviceAddress,
    pub address_type: u8,
    pub key_type: u8,
    pub value: [u8; 16],
    pub pin_length: u8,
}

impl LinkKeyInfo {
    pub const SIZE: usize = 25;

    fn parse(data: &[u8]) -> Option<LinkKeyInfo> {
        if data.len() < Self::SIZE {
            return None;
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[0..6]);
        let mut value = [0u8; 16];
        value.copy_from_slice(&data[8..24]);

        Some(LinkKeyInfo {
            address,
            address_type: data[6],
            key_type: data[7],
            value,
            pin_length: data[24],
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address);
        out.push(self.address_type);
        out.push(self.key_type);
        out.extend_from_slice(&self.value);
        out.push(self.pin_length);
    }
}

/// A long term key record as carried by LOAD_LONG_TERM_KEYS and NEW_LONG_TERM_KEY
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct LongTermKeyInfo {
    pub address: BluetoothDeviceAddress,
    pub address_type: u8,
    pub key_type: u8,
    pub master: u8,
    pub enc_size: u8,
    pub ediv: u16,
    pub rand: u64,
    pub value: [u8; 16],
}

impl LongTermKeyInfo {
    pub const SIZE: usize = 36;

    fn parse(data: &[u8]) -> Option<LongTermKeyInfo> {
        if data.len() < Self::SIZE {
            return None;
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[0..6]);
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&data[12..20]);
        let mut value = [0u8; 16];
        value.copy_from_slice(&data[20..36]);

        Some(LongTermKeyInfo {
            address,
            address_type: data[6],
            key_type: data[7],
            master: data[8],
            enc_size: data[9],
            ediv: <u16>::from_le_bytes([data[10], data[11]]),
            rand: <u64>::from_le_bytes(rand),
            value,
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address);
        out.push(self.address_type);
        out.push(self.key_type);
        out.push(self.master);
        out.push(self.enc_size);
        out.extend_from_slice(&self.ediv.to_le_bytes());
        out.extend_from_slice(&self.rand.to_le_bytes());
        out.extend_from_slice(&self.value);
    }
}

/// An identity resolving key record
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct IrkInfo {
    pub address: BluetoothDeviceAddress,
    pub address_type: u8,
    pub value: [u8; 16],
}

impl IrkInfo {
    pub const SIZE: usize = 23;

    fn parse(data: &[u8]) -> Option<IrkInfo> {
        if data.len() < Self::SIZE {
            return None;
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[0..6]);
        let mut value = [0u8; 16];
        value.copy_from_slice(&data[7..23]);

        Some(IrkInfo { address, address_type: data[6], value })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address);
        out.push(self.address_type);
        out.extend_from_slice(&self.value);
    }
}

/// A connection signature resolving key record
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct CsrkInfo {
    pub address: BluetoothDeviceAddress,
    pub address_type: u8,
    pub key_type: u8,
    pub value: [u8; 16],
}

impl CsrkInfo {
    pub const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Option<CsrkInfo> {
        if data.len() < Self::SIZE {
            return None;
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[0..6]);
        let mut value = [0u8; 16];
        value.copy_from_slice(&data[8..24]);

        Some(CsrkInfo { address, address_type: data[6], key_type: data[7], value })
    }
}

/// Connection parameters for LOAD_CONN_PARAM
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ConnParam {
    pub address: BluetoothDeviceAddress,
    pub address_type: u8,
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl ConnParam {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address);
        out.push(self.address_type);
        out.extend_from_slice(&self.min_interval.to_le_bytes());
        out.extend_from_slice(&self.max_interval.to_le_bytes());
        out.extend_from_slice(&self.latency.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
    }
}

/// Everything READ_INFO reports about an adapter
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct AdapterInfo {
    pub dev_id: u16,
    pub address: BluetoothDeviceAddress,
    pub version: u8,
    pub manufacturer: u16,
    pub supported_settings: AdapterSetting,
    pub current_settings: AdapterSetting,
    pub dev_class: [u8; 3],
    pub name: String,
    pub short_name: String,
}

impl AdapterInfo {
    /// Minimum READ_INFO reply payload: everything up to the names
    pub const MIN_SIZE: usize = 6 + 1 + 2 + 4 + 4 + 3;

    /// Parse the CMD_COMPLETE data of a READ_INFO command
    pub fn parse(dev_id: u16, data: &[u8]) -> Result<AdapterInfo, Error> {
        if data.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPdu {
                what: "AdapterInfo", min: Self::MIN_SIZE, actual: data.len(),
            });
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[0..6]);

        let supported = <u32>::from_le_bytes([data[9], data[10], data[11], data[12]]);
        let current = <u32>::from_le_bytes([data[13], data[14], data[15], data[16]]);

        let mut dev_class = [0u8; 3];
        dev_class.copy_from_slice(&data[17..20]);

        let name = if data.len() > 20 {
            read_nul_string(&data[20..data.len().min(20 + MAX_NAME_LENGTH)])
        } else {
            String::new()
        };

        let short_name = if data.len() > 20 + MAX_NAME_LENGTH {
            read_nul_string(&data[20 + MAX_NAME_LENGTH..])
        } else {
            String::new()
        };

        Ok(AdapterInfo {
            dev_id,
            address,
            version: data[6],
            manufacturer: <u16>::from_le_bytes([data[7], data[8]]),
            supported_settings: AdapterSetting::from_bits_truncate(supported),
            current_settings: AdapterSetting::from_bits_truncate(current),
            dev_class,
            name,
            short_name,
        })
    }
}

impl core::fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "adapter {} [{}] '{}' settings {:?}",
            self.dev_id,
            crate::bluetooth_address_string(&self.address),
            self.name,
            self.current_settings)
    }
}

/// An outgoing management command frame
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct MgmtCommand {
    frame: Octets,
}

impl MgmtCommand {
    fn with_param(op: MgmtCommandOpcode, dev_id: u16, param: &[u8]) -> MgmtCommand {
        let mut frame = Octets::zeroed(MGMT_HEADER_SIZE + param.len());

        write_header(&mut frame, op.into(), dev_id, param.len());
        frame.put_slice(MGMT_HEADER_SIZE, param).unwrap();

        MgmtCommand { frame }
    }

    pub fn opcode(&self) -> u16 {
        self.frame.get_u16(0).unwrap()
    }

    pub fn dev_id(&self) -> u16 {
        self.frame.get_u16(2).unwrap()
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.as_ref()
    }

    pub fn read_version() -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::ReadVersion, DEV_ID_NONE, &[])
    }

    pub fn read_index_list() -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::ReadIndexList, DEV_ID_NONE, &[])
    }

    pub fn read_info(dev_id: u16) -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::ReadInfo, dev_id, &[])
    }

    /// The single-u8 mode setters: SET_POWERED, SET_CONNECTABLE, ...
    pub fn set_mode(op: MgmtCommandOpcode, dev_id: u16, enable: bool) -> MgmtCommand {
        Self::with_param(op, dev_id, &[enable as u8])
    }

    pub fn set_powered(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetPowered, dev_id, on)
    }

    pub fn set_connectable(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetConnectable, dev_id, on)
    }

    pub fn set_fast_connectable(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetFastConnectable, dev_id, on)
    }

    pub fn set_bondable(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetBondable, dev_id, on)
    }

    pub fn set_link_security(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetLinkSecurity, dev_id, on)
    }

    pub fn set_ssp(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetSsp, dev_id, on)
    }

    pub fn set_le(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetLe, dev_id, on)
    }

    pub fn set_bredr(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetBredr, dev_id, on)
    }

    pub fn set_advertising(dev_id: u16, on: bool) -> MgmtCommand {
        Self::set_mode(MgmtCommandOpcode::SetAdvertising, dev_id, on)
    }

    /// 0x00 disabled, 0x01 mixed, 0x02 secure connections only
    pub fn set_secure_conn(dev_id: u16, mode: u8) -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::SetSecureConn, dev_id, &[mode])
    }

    pub fn set_privacy(dev_id: u16, privacy: u8, irk: &[u8; 16]) -> MgmtCommand {
        let mut param = alloc::vec![privacy];
        param.extend_from_slice(irk);
        Self::with_param(MgmtCommandOpcode::SetPrivacy, dev_id, &param)
    }

    pub fn set_discoverable(dev_id: u16, discoverable: u8, timeout: u16) -> MgmtCommand {
        let mut param = alloc::vec![discoverable];
        param.extend_from_slice(&timeout.to_le_bytes());
        Self::with_param(MgmtCommandOpcode::SetDiscoverable, dev_id, &param)
    }

    pub fn set_local_name(dev_id: u16, name: &str, short_name: &str) -> MgmtCommand {
        let mut frame = Octets::zeroed(
            MGMT_HEADER_SIZE + MAX_NAME_LENGTH + MAX_SHORT_NAME_LENGTH,
        );

        write_header(
            &mut frame,
            MgmtCommandOpcode::SetLocalName.into(),
            dev_id,
            MAX_NAME_LENGTH + MAX_SHORT_NAME_LENGTH,
        );
        put_nul_string(&mut frame, MGMT_HEADER_SIZE, name, MAX_NAME_LENGTH);
        put_nul_string(
            &mut frame,
            MGMT_HEADER_SIZE + MAX_NAME_LENGTH,
            short_name,
            MAX_SHORT_NAME_LENGTH,
        );

        MgmtCommand { frame }
    }

    pub fn disconnect(dev_id: u16, address: &BluetoothDeviceAddress, address_type: u8) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::Disconnect, dev_id, &param)
    }

    /// `scan_type` is a bitset: bit 0 BR/EDR, bits 1..2 LE
    pub fn start_discovery(dev_id: u16, scan_type: u8) -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::StartDiscovery, dev_id, &[scan_type])
    }

    pub fn stop_discovery(dev_id: u16, scan_type: u8) -> MgmtCommand {
        Self::with_param(MgmtCommandOpcode::StopDiscovery, dev_id, &[scan_type])
    }

    /// The scan type matching a [`BtMode`]
    pub fn scan_type_of(mode: BtMode) -> u8 {
        match mode {
            BtMode::Dual => 0x07,
            BtMode::BrEdr => 0x01,
            BtMode::Le => 0x06,
        }
    }

    pub fn add_device_whitelist(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        action: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        param.push(action);
        Self::with_param(MgmtCommandOpcode::AddDeviceWhitelist, dev_id, &param)
    }

    pub fn remove_device_whitelist(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::RemoveDeviceWhitelist, dev_id, &param)
    }

    pub fn pair_device(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        io_capability: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        param.push(io_capability);
        Self::with_param(MgmtCommandOpcode::PairDevice, dev_id, &param)
    }

    pub fn cancel_pair_device(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::CancelPairDevice, dev_id, &param)
    }

    pub fn unpair_device(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        disconnect: bool,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        param.push(disconnect as u8);
        Self::with_param(MgmtCommandOpcode::UnpairDevice, dev_id, &param)
    }

    pub fn pin_code_reply(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        pin: &[u8],
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        param.push(pin.len().min(16) as u8);

        let mut code = [0u8; 16];
        code[..pin.len().min(16)].copy_from_slice(&pin[..pin.len().min(16)]);
        param.extend_from_slice(&code);

        Self::with_param(MgmtCommandOpcode::PinCodeReply, dev_id, &param)
    }

    pub fn pin_code_neg_reply(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::PinCodeNegReply, dev_id, &param)
    }

    pub fn user_confirm_reply(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        positive: bool,
    ) -> MgmtCommand {
        let op = if positive {
            MgmtCommandOpcode::UserConfirmReply
        } else {
            MgmtCommandOpcode::UserConfirmNegReply
        };

        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(op, dev_id, &param)
    }

    pub fn user_passkey_reply(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        passkey: u32,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        param.extend_from_slice(&passkey.to_le_bytes());
        Self::with_param(MgmtCommandOpcode::UserPasskeyReply, dev_id, &param)
    }

    pub fn user_passkey_neg_reply(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::UserPasskeyNegReply, dev_id, &param)
    }

    pub fn get_conn_info(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> MgmtCommand {
        let mut param = address.to_vec();
        param.push(address_type);
        Self::with_param(MgmtCommandOpcode::GetConnInfo, dev_id, &param)
    }

    pub fn load_link_keys(dev_id: u16, debug_keys: bool, keys: &[LinkKeyInfo]) -> MgmtCommand {
        let mut param = alloc::vec![debug_keys as u8];
        param.extend_from_slice(&(keys.len() as u16).to_le_bytes());
        keys.iter().for_each(|k| k.write_to(&mut param));
        Self::with_param(MgmtCommandOpcode::LoadLinkKeys, dev_id, &param)
    }

    pub fn load_long_term_keys(dev_id: u16, keys: &[LongTermKeyInfo]) -> MgmtCommand {
        let mut param = (keys.len() as u16).to_le_bytes().to_vec();
        keys.iter().for_each(|k| k.write_to(&mut param));
        Self::with_param(MgmtCommandOpcode::LoadLongTermKeys, dev_id, &param)
    }

    pub fn load_irks(dev_id: u16, irks: &[IrkInfo]) -> MgmtCommand {
        let mut param = (irks.len() as u16).to_le_bytes().to_vec();
        irks.iter().for_each(|k| k.write_to(&mut param));
        Self::with_param(MgmtCommandOpcode::LoadIrks, dev_id, &param)
    }

    pub fn load_conn_param(dev_id: u16, params: &[ConnParam]) -> MgmtCommand {
        let mut param = (params.len() as u16).to_le_bytes().to_vec();
        params.iter().for_each(|p| p.write_to(&mut param));
        Self::with_param(MgmtCommandOpcode::LoadConnParam, dev_id, &param)
    }
}

impl core::fmt::Display for MgmtCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match MgmtCommandOpcode::try_from(self.opcode()) {
            Ok(op) => write!(f, "{:?} dev {:#06x}", op, self.dev_id()),
            Err(_) => write!(f, "mgmt command {:#06x} dev {:#06x}", self.opcode(), self.dev_id()),
        }
    }
}

/// A received management event frame
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct MgmtEvent {
    frame: Octets,
}

impl MgmtEvent {
    /// Parse a frame read off the control socket
    ///
    /// Requires the full header and at least `param_len` bytes of payload.
    pub fn parse(frame: Octets) -> Result<MgmtEvent, Error> {
        if frame.size() < MGMT_HEADER_SIZE {
            return Err(Error::InvalidPdu {
                what: "MgmtEvent", min: MGMT_HEADER_SIZE, actual: frame.size(),
            });
        }

        let event = MgmtEvent { frame };
        let total = MGMT_HEADER_SIZE + event.param_len();

        if event.frame.size() < total {
            return Err(Error::InvalidPdu {
                what: "MgmtEvent", min: total, actual: event.frame.size(),
            });
        }

        Ok(event)
    }

    fn build(opcode: MgmtEventOpcode, dev_id: u16, param: &[u8]) -> MgmtEvent {
        let mut frame = Octets::zeroed(MGMT_HEADER_SIZE + param.len());

        write_header(&mut frame, opcode.into(), dev_id, param.len());
        frame.put_slice(MGMT_HEADER_SIZE, param).unwrap();

        MgmtEvent { frame }
    }

    pub fn new_cmd_complete(dev_id: u16, cmd_opcode: u16, status: u8, data: &[u8]) -> MgmtEvent {
        let mut param = cmd_opcode.to_le_bytes().to_vec();
        param.push(status);
        param.extend_from_slice(data);
        Self::build(MgmtEventOpcode::CmdComplete, dev_id, &param)
    }

    pub fn new_cmd_status(dev_id: u16, cmd_opcode: u16, status: u8) -> MgmtEvent {
        let mut param = cmd_opcode.to_le_bytes().to_vec();
        param.push(status);
        Self::build(MgmtEventOpcode::CmdStatus, dev_id, &param)
    }

    pub fn new_index_added(dev_id: u16) -> MgmtEvent {
        Self::build(MgmtEventOpcode::IndexAdded, dev_id, &[])
    }

    pub fn new_index_removed(dev_id: u16) -> MgmtEvent {
        Self::build(MgmtEventOpcode::IndexRemoved, dev_id, &[])
    }

    pub fn new_settings_event(dev_id: u16, settings: AdapterSetting) -> MgmtEvent {
        Self::build(MgmtEventOpcode::NewSettings, dev_id, &settings.bits().to_le_bytes())
    }

    /// Synthesized by the dispatcher when the local side tears a link down
    pub fn new_device_disconnected(
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        reason: u8,
    ) -> MgmtEvent {
        let mut param = address.to_vec();
        param.push(address_type);
        param.push(reason);
        Self::build(MgmtEventOpcode::DeviceDisconnected, dev_id, &param)
    }

    pub fn opcode_raw(&self) -> u16 {
        self.frame.get_u16(0).unwrap()
    }

    pub fn opcode(&self) -> Option<MgmtEventOpcode> {
        MgmtEventOpcode::try_from(self.opcode_raw()).ok()
    }

    pub fn dev_id(&self) -> u16 {
        self.frame.get_u16(2).unwrap()
    }

    pub fn param_len(&self) -> usize {
        self.frame.get_u16(4).unwrap() as usize
    }

    pub fn param(&self) -> &[u8] {
        self.frame.get_slice(MGMT_HEADER_SIZE, self.param_len()).unwrap()
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.as_ref()
    }

    /// CMD_COMPLETE fields: the answered command opcode, status, and data
    pub fn cmd_complete(&self) -> Option<(u16, MgmtStatus, &[u8])> {
        if self.opcode() != Some(MgmtEventOpcode::CmdComplete) || self.param_len() < 3 {
            return None;
        }

        let param = self.param();
        Some((
            <u16>::from_le_bytes([param[0], param[1]]),
            MgmtStatus::from_raw(param[2]),
            &param[3..],
        ))
    }

    /// CMD_STATUS fields: the answered command opcode and status
    pub fn cmd_status(&self) -> Option<(u16, MgmtStatus)> {
        if self.opcode() != Some(MgmtEventOpcode::CmdStatus) || self.param_len() < 3 {
            return None;
        }

        let param = self.param();
        Some((
            <u16>::from_le_bytes([param[0], param[1]]),
            MgmtStatus::from_raw(param[2]),
        ))
    }

    /// Whether this is a reply event answering `cmd`
    ///
    /// A reply matches on the same `dev_id` and the same command opcode.
    pub fn answers(&self, cmd: &MgmtCommand) -> bool {
        if self.dev_id() != cmd.dev_id() {
            return false;
        }

        match self.cmd_complete() {
            Some((op, _, _)) => op == cmd.opcode(),
            None => match self.cmd_status() {
                Some((op, _)) => op == cmd.opcode(),
                None => false,
            },
        }
    }

    pub fn new_settings(&self) -> Option<AdapterSetting> {
        if self.opcode() != Some(MgmtEventOpcode::NewSettings) || self.param_len() < 4 {
            return None;
        }

        let p = self.param();
        Some(AdapterSetting::from_bits_truncate(
            <u32>::from_le_bytes([p[0], p[1], p[2], p[3]]),
        ))
    }

    fn address_prefix(&self) -> Option<(BluetoothDeviceAddress, u8)> {
        let p = self.param();
        if p.len() < 7 {
            return None;
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&p[0..6]);
        Some((address, p[6]))
    }

    /// DEVICE_CONNECTED: address, address type, flags, EIR payload
    pub fn device_connected(&self) -> Option<(BluetoothDeviceAddress, u8, u32, &[u8])> {
        if self.opcode() != Some(MgmtEventOpcode::DeviceConnected) || self.param_len() < 13 {
            return None;
        }

        let (address, address_type) = self.address_prefix()?;
        let p = self.param();
        let flags = <u32>::from_le_bytes([p[7], p[8], p[9], p[10]]);
        let eir_len = <u16>::from_le_bytes([p[11], p[12]]) as usize;
        let eir = &p[13..p.len().min(13 + eir_len)];

        Some((address, address_type, flags, eir))
    }

    /// DEVICE_DISCONNECTED: address, address type, reason
    pub fn device_disconnected(&self) -> Option<(BluetoothDeviceAddress, u8, u8)> {
        if self.opcode() != Some(MgmtEventOpcode::DeviceDisconnected) || self.param_len() < 8 {
            return None;
        }

        let (address, address_type) = self.address_prefix()?;
        Some((address, address_type, self.param()[7]))
    }

    /// CONNECT_FAILED: address, address type, status
    pub fn connect_failed(&self) -> Option<(BluetoothDeviceAddress, u8, MgmtStatus)> {
        if self.opcode() != Some(MgmtEventOpcode::ConnectFailed) || self.param_len() < 8 {
            return None;
        }

        let (address, address_type) = self.address_prefix()?;
        Some((address, address_type, MgmtStatus::from_raw(self.param()[7])))
    }

    /// NEW_LINK_KEY: store hint and the key record
    pub fn new_link_key(&self) -> Option<(bool, LinkKeyInfo)> {
        if self.opcode() != Some(MgmtEventOpcode::NewLinkKey) {
            return None;
        }

        let p = self.param();
        Some((*p.get(0)? != 0, LinkKeyInfo::parse(&p[1..])?))
    }

    /// NEW_LONG_TERM_KEY: store hint and the key record
    pub fn new_long_term_key(&self) -> Option<(bool, LongTermKeyInfo)> {
        if self.opcode() != Some(MgmtEventOpcode::NewLongTermKey) {
            return None;
        }

        let p = self.param();
        Some((*p.get(0)? != 0, LongTermKeyInfo::parse(&p[1..])?))
    }

    /// NEW_IRK: store hint, the resolvable private address, and the key
    pub fn new_irk(&self) -> Option<(bool, BluetoothDeviceAddress, IrkInfo)> {
        if self.opcode() != Some(MgmtEventOpcode::NewIrk) {
            return None;
        }

        let p = self.param();
        if p.len() < 1 + 6 + IrkInfo::SIZE {
            return None;
        }

        let mut rpa = [0u8; 6];
        rpa.copy_from_slice(&p[1..7]);

        Some((p[0] != 0, rpa, IrkInfo::parse(&p[7..])?))
    }

    /// NEW_CSRK: store hint and the key record
    pub fn new_csrk(&self) -> Option<(bool, CsrkInfo)> {
        if self.opcode() != Some(MgmtEventOpcode::NewCsrk) {
            return None;
        }

        let p = self.param();
        Some((*p.get(0)? != 0, CsrkInfo::parse(&p[1..])?))
    }

    /// DISCOVERING: scan type and enabled flag
    pub fn discovering(&self) -> Option<(u8, bool)> {
        if self.opcode() != Some(MgmtEventOpcode::Discovering) || self.param_len() < 2 {
            return None;
        }

        let p = self.param();
        Some((p[0], p[1] != 0))
    }

    /// DEVICE_FOUND: address, address type, rssi, flags, EIR payload
    pub fn device_found(&self) -> Option<(BluetoothDeviceAddress, u8, i8, u32, &[u8])> {
        if self.opcode() != Some(MgmtEventOpcode::DeviceFound) || self.param_len() < 14 {
            return None;
        }

        let (address, address_type) = self.address_prefix()?;
        let p = self.param();
        let rssi = p[7] as i8;
        let flags = <u32>::from_le_bytes([p[8], p[9], p[10], p[11]]);
        let eir_len = <u16>::from_le_bytes([p[12], p[13]]) as usize;
        let eir = &p[14..p.len().min(14 + eir_len)];

        Some((address, address_type, rssi, flags, eir))
    }

    /// LOCAL_NAME_CHANGED: name and short name
    pub fn local_name_changed(&self) -> Option<(String, String)> {
        if self.opcode() != Some(MgmtEventOpcode::LocalNameChanged) {
            return None;
        }

        let p = self.param();
        if p.len() < MAX_NAME_LENGTH + MAX_SHORT_NAME_LENGTH {
            return None;
        }

        Some((
            read_nul_string(&p[..MAX_NAME_LENGTH]),
            read_nul_string(&p[MAX_NAME_LENGTH..]),
        ))
    }
}

impl core::fmt::Display for MgmtEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{:?} dev {:#06x} [{} bytes]", op, self.dev_id(), self.param_len()),
            None => write!(f, "mgmt event {:#06x} dev {:#06x}", self.opcode_raw(), self.dev_id()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_header_framing() {
        let cmd = MgmtCommand::set_powered(2, true);

        assert_eq!(&[0x05, 0x00, 0x02, 0x00, 0x01, 0x00, 0x01], cmd.bytes());
        assert_eq!(0x0005, cmd.opcode());
        assert_eq!(2, cmd.dev_id());
    }

    #[test]
    fn read_version_uses_no_adapter_id() {
        let cmd = MgmtCommand::read_version();

        assert_eq!(DEV_ID_NONE, cmd.dev_id());
        assert_eq!(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x00], cmd.bytes());
    }

    #[test]
    fn cmd_complete_round_trip() {
        let evt = MgmtEvent::new_cmd_complete(1, 0x0005, 0x00, &[0x01]);
        let evt = MgmtEvent::parse(Octets::from_slice(evt.bytes())).unwrap();

        let (op, status, data) = evt.cmd_complete().unwrap();

        assert_eq!(0x0005, op);
        assert_eq!(MgmtStatus::Success, status);
        assert_eq!(&[0x01], data);

        let cmd = MgmtCommand::set_powered(1, true);
        assert!(evt.answers(&cmd));
        assert!(!evt.answers(&MgmtCommand::set_powered(2, true)));
        assert!(!evt.answers(&MgmtCommand::set_le(1, true)));
    }

    #[test]
    fn short_event_rejected() {
        assert!(MgmtEvent::parse(Octets::from_slice(&[0x01, 0x00, 0x00])).is_err());

        // header claims more payload than present
        let bad = [0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0xAA];
        assert!(MgmtEvent::parse(Octets::from_slice(&bad)).is_err());
    }

    #[test]
    fn new_settings_bits() {
        let settings = AdapterSetting::POWERED | AdapterSetting::LE | AdapterSetting::SSP;
        let evt = MgmtEvent::new_settings_event(0, settings);
        let evt = MgmtEvent::parse(Octets::from_slice(evt.bytes())).unwrap();

        assert_eq!(Some(settings), evt.new_settings());
        assert_eq!(0x0000_0241, settings.bits());
    }

    #[test]
    fn adapter_info_parse() {
        let mut data = alloc::vec![
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // address
            0x08,                               // version
            0x0F, 0x00,                         // manufacturer
            0xFF, 0xFF, 0x01, 0x00,             // supported
            0x41, 0x02, 0x00, 0x00,             // current: POWERED | SSP | LE
            0x0C, 0x01, 0x02,                   // dev class
        ];
        data.extend_from_slice(b"hci0\0");

        let info = AdapterInfo::parse(0, &data).unwrap();

        assert_eq!([0x01, 0x02, 0x03, 0x04, 0x05, 0x06], info.address);
        assert_eq!(8, info.version);
        assert_eq!(15, info.manufacturer);
        assert!(info.current_settings.contains(AdapterSetting::POWERED));
        assert!(info.current_settings.contains(AdapterSetting::LE));
        assert!(!info.current_settings.contains(AdapterSetting::BREDR));
        assert_eq!("hci0", info.name);
        assert_eq!("", info.short_name);

        assert!(AdapterInfo::parse(0, &data[..10]).is_err());
    }

    #[test]
    fn long_term_key_event() {
        let mut param = alloc::vec![0x01]; // store hint
        param.extend_from_slice(&[0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]); // address
        param.push(0x01); // le public
        param.push(0x00); // unauthenticated
        param.push(0x01); // master
        param.push(16);   // enc size
        param.extend_from_slice(&0x1234u16.to_le_bytes()); // ediv
        param.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes()); // rand
        param.extend_from_slice(&[0x11; 16]); // value

        let evt = MgmtEvent::build(MgmtEventOpcode::NewLongTermKey, 0, &param);
        let (store, ltk) = evt.new_long_term_key().unwrap();

        assert!(store);
        assert_eq!([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6], ltk.address);
        assert_eq!(0x1234, ltk.ediv);
        assert_eq!(0x0102_0304_0506_0708, ltk.rand);
        assert_eq!([0x11; 16], ltk.value);
        assert_eq!(16, ltk.enc_size);
    }

    #[test]
    fn device_found_carries_eir() {
        let mut param = alloc::vec![0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0x01];
        param.push(0xC8u8); // rssi -56
        param.extend_from_slice(&0u32.to_le_bytes());
        let eir = [0x02, 0x01, 0x06]; // flags block
        param.extend_from_slice(&(eir.len() as u16).to_le_bytes());
        param.extend_from_slice(&eir);

        let evt = MgmtEvent::build(MgmtEventOpcode::DeviceFound, 1, &param);
        let (addr, addr_type, rssi, flags, data) = evt.device_found().unwrap();

        assert_eq!([0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6], addr);
        assert_eq!(1, addr_type);
        assert_eq!(-56, rssi);
        assert_eq!(0, flags);
        assert_eq!(&eir, data);
    }

    #[test]
    fn set_local_name_fixed_widths() {
        let cmd = MgmtCommand::set_local_name(0, "my adapter", "mine");

        assert_eq!(
            MGMT_HEADER_SIZE + MAX_NAME_LENGTH + MAX_SHORT_NAME_LENGTH,
            cmd.bytes().len()
        );
        assert_eq!(b"my adapter\0", &cmd.bytes()[6..17]);
        assert_eq!(b"mine\0", &cmd.bytes()[6 + MAX_NAME_LENGTH..6 + MAX_NAME_LENGTH + 5]);
    }

    #[test]
    fn load_keys_record_sizes() {
        let ltk = LongTermKeyInfo {
            address: [0; 6],
            address_type: 1,
            key_type: 0,
            master: 0,
            enc_size: 16,
            ediv: 0,
            rand: 0,
            value: [0; 16],
        };

        let cmd = MgmtCommand::load_long_term_keys(0, &[ltk.clone(), ltk]);

        assert_eq!(
            MGMT_HEADER_SIZE + 2 + 2 * LongTermKeyInfo::SIZE,
            cmd.bytes().len()
        );

        let irk = IrkInfo { address: [0; 6], address_type: 1, value: [7; 16] };
        let cmd = MgmtCommand::load_irks(0, &[irk]);

        assert_eq!(MGMT_HEADER_SIZE + 2 + IrkInfo::SIZE, cmd.bytes().len());
    }
}
