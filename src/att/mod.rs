//! The Attribute Protocol
//!
//! This is the PDU codec for the Attribute Protocol as defined in the
//! Bluetooth Specification (version 5.2), Vol. 3, Part F. PDUs move over an
//! L2CAP channel, CID 0x0004 for LE.
//!
//! *Commands*, *Requests*, and *Confirmations* are sent by the client to the
//! server; *Responses*, *Notifications* and *Indications* are sent by the
//! server to the client.

pub mod pdu;

use crate::buffer;

/// L2CAP channel identifier carrying the Attribute Protocol on LE links
pub const L2CAP_ATT_CID: u16 = 0x0004;

/// The minimum ATT bearer MTU for Bluetooth LE
pub const MIN_ATT_MTU_LE: u16 = 23;

/// The minimum ATT bearer MTU for BR/EDR
pub const MIN_ATT_MTU_BR_EDR: u16 = 48;

/// Maximum length of an attribute value plus one byte of opcode
///
/// BT Core Spec v5.2: Vol 3, Part F 3.2.8 caps an attribute value at 512
/// octets; the transmission adds the opcode upfront.
pub const MAX_ATT_MTU: u16 = 512 + 1;

/// Size of the authentication signature trailing a signed PDU
pub const AUTH_SIG_SIZE: usize = 12;

/// Attribute opcodes
///
/// The raw opcode byte splits into the method (bits 0..5), the command flag
/// (bit 6, no reply expected) and the authentication signature flag (bit 7).
#[derive(Clone,Copy,Debug,PartialEq,PartialOrd,Eq)]
pub enum AttOpcode {
    ErrorRsp,
    ExchangeMtuReq,
    ExchangeMtuRsp,
    FindInfoReq,
    FindInfoRsp,
    FindByTypeValueReq,
    FindByTypeValueRsp,
    ReadByTypeReq,
    ReadByTypeRsp,
    ReadReq,
    ReadRsp,
    ReadBlobReq,
    ReadBlobRsp,
    ReadByGroupTypeReq,
    ReadByGroupTypeRsp,
    WriteReq,
    WriteRsp,
    WriteCmd,
    SignedWriteCmd,
    PrepareWriteReq,
    PrepareWriteRsp,
    ExecuteWriteReq,
    ExecuteWriteRsp,
    HandleValueNtf,
    HandleValueInd,
    HandleValueCfm,
}

impl From<AttOpcode> for u8 {
    fn from(op: AttOpcode) -> u8 {
        match op {
            AttOpcode::ErrorRsp => 0x01,
            AttOpcode::ExchangeMtuReq => 0x02,
            AttOpcode::ExchangeMtuRsp => 0x03,
            AttOpcode::FindInfoReq => 0x04,
            AttOpcode::FindInfoRsp => 0x05,
            AttOpcode::FindByTypeValueReq => 0x06,
            AttOpcode::FindByTypeValueRsp => 0x07,
            AttOpcode::ReadByTypeReq => 0x08,
            AttOpcode::ReadByTypeRsp => 0x09,
            AttOpcode::ReadReq => 0x0A,
            AttOpcode::ReadRsp => 0x0B,
            AttOpcode::ReadBlobReq => 0x0C,
            AttOpcode::ReadBlobRsp => 0x0D,
            AttOpcode::ReadByGroupTypeReq => 0x10,
            AttOpcode::ReadByGroupTypeRsp => 0x11,
            AttOpcode::WriteReq => 0x12,
            AttOpcode::WriteRsp => 0x13,
            AttOpcode::WriteCmd => 0x52,
            AttOpcode::SignedWriteCmd => 0xD2,
            AttOpcode::PrepareWriteReq => 0x16,
            AttOpcode::PrepareWriteRsp => 0x17,
            AttOpcode::ExecuteWriteReq => 0x18,
            AttOpcode::ExecuteWriteRsp => 0x19,
            AttOpcode::HandleValueNtf => 0x1B,
            AttOpcode::HandleValueInd => 0x1D,
            AttOpcode::HandleValueCfm => 0x1E,
        }
    }
}

impl core::convert::TryFrom<u8> for AttOpcode {
    type Error = ();

    fn try_from(val: u8) -> Result<Self, ()> {
        match val {
            0x01 => Ok(AttOpcode::ErrorRsp),
            0x02 => Ok(AttOpcode::ExchangeMtuReq),
            0x03 => Ok(AttOpcode::ExchangeMtuRsp),
            0x04 => Ok(AttOpcode::FindInfoReq),
            0x05 => Ok(AttOpcode::FindInfoRsp),
            0x06 => Ok(AttOpcode::FindByTypeValueReq),
            0x07 => Ok(AttOpcode::FindByTypeValueRsp),
            0x08 => Ok(AttOpcode::ReadByTypeReq),
            0x09 => Ok(AttOpcode::ReadByTypeRsp),
            0x0A => Ok(AttOpcode::ReadReq),
            0x0B => Ok(AttOpcode::ReadRsp),
            0x0C => Ok(AttOpcode::ReadBlobReq),
            0x0D => Ok(AttOpcode::ReadBlobRsp),
            0x10 => Ok(AttOpcode::ReadByGroupTypeReq),
            0x11 => Ok(AttOpcode::ReadByGroupTypeRsp),
            0x12 => Ok(AttOpcode::WriteReq),
            0x13 => Ok(AttOpcode::WriteRsp),
            0x52 => Ok(AttOpcode::WriteCmd),
            0xD2 => Ok(AttOpcode::SignedWriteCmd),
            0x16 => Ok(AttOpcode::PrepareWriteReq),
            0x17 => Ok(AttOpcode::PrepareWriteRsp),
            0x18 => Ok(AttOpcode::ExecuteWriteReq),
            0x19 => Ok(AttOpcode::ExecuteWriteRsp),
            0x1B => Ok(AttOpcode::HandleValueNtf),
            0x1D => Ok(AttOpcode::HandleValueInd),
            0x1E => Ok(AttOpcode::HandleValueCfm),
            _ => Err(()),
        }
    }
}

impl AttOpcode {
    /// The method bits of the raw opcode
    pub fn method(raw: u8) -> u8 { raw & 0x3F }

    /// Command flag, bit 6. Commands expect no reply.
    pub fn is_command(raw: u8) -> bool { raw & 0x40 != 0 }

    /// Authentication signature flag, bit 7
    pub fn has_auth_signature(raw: u8) -> bool { raw & 0x80 != 0 }

    /// Whether this opcode is a server-sent response to a request
    pub fn is_response(&self) -> bool {
        match self {
            AttOpcode::ErrorRsp
            | AttOpcode::ExchangeMtuRsp
            | AttOpcode::FindInfoRsp
            | AttOpcode::FindByTypeValueRsp
            | AttOpcode::ReadByTypeRsp
            | AttOpcode::ReadRsp
            | AttOpcode::ReadBlobRsp
            | AttOpcode::ReadByGroupTypeRsp
            | AttOpcode::WriteRsp
            | AttOpcode::PrepareWriteRsp
            | AttOpcode::ExecuteWriteRsp => true,
            _ => false,
        }
    }

    /// Whether this opcode is a client-sent request that expects a response
    pub fn is_request(&self) -> bool {
        match self {
            AttOpcode::ExchangeMtuReq
            | AttOpcode::FindInfoReq
            | AttOpcode::FindByTypeValueReq
            | AttOpcode::ReadByTypeReq
            | AttOpcode::ReadReq
            | AttOpcode::ReadBlobReq
            | AttOpcode::ReadByGroupTypeReq
            | AttOpcode::WriteReq
            | AttOpcode::PrepareWriteReq
            | AttOpcode::ExecuteWriteReq => true,
            _ => false,
        }
    }

    /// The response opcode answering this request, if any
    pub fn response_opcode(&self) -> Option<AttOpcode> {
        match self {
            AttOpcode::ExchangeMtuReq => Some(AttOpcode::ExchangeMtuRsp),
            AttOpcode::FindInfoReq => Some(AttOpcode::FindInfoRsp),
            AttOpcode::FindByTypeValueReq => Some(AttOpcode::FindByTypeValueRsp),
            AttOpcode::ReadByTypeReq => Some(AttOpcode::ReadByTypeRsp),
            AttOpcode::ReadReq => Some(AttOpcode::ReadRsp),
            AttOpcode::ReadBlobReq => Some(AttOpcode::ReadBlobRsp),
            AttOpcode::ReadByGroupTypeReq => Some(AttOpcode::ReadByGroupTypeRsp),
            AttOpcode::WriteReq => Some(AttOpcode::WriteRsp),
            AttOpcode::PrepareWriteReq => Some(AttOpcode::PrepareWriteRsp),
            AttOpcode::ExecuteWriteReq => Some(AttOpcode::ExecuteWriteRsp),
            _ => None,
        }
    }
}

impl core::fmt::Display for AttOpcode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let name = match self {
            AttOpcode::ErrorRsp => "Error Response",
            AttOpcode::ExchangeMtuReq => "Exchange MTU Request",
            AttOpcode::ExchangeMtuRsp => "Exchange MTU Response",
            AttOpcode::FindInfoReq => "Find Information Request",
            AttOpcode::FindInfoRsp => "Find Information Response",
            AttOpcode::FindByTypeValueReq => "Find By Type Value Request",
            AttOpcode::FindByTypeValueRsp => "Find By Type Value Response",
            AttOpcode::ReadByTypeReq => "Read By Type Request",
            AttOpcode::ReadByTypeRsp => "Read By Type Response",
            AttOpcode::ReadReq => "Read Request",
            AttOpcode::ReadRsp => "Read Response",
            AttOpcode::ReadBlobReq => "Read Blob Request",
            AttOpcode::ReadBlobRsp => "Read Blob Response",
            AttOpcode::ReadByGroupTypeReq => "Read By Group Type Request",
            AttOpcode::ReadByGroupTypeRsp => "Read By Group Type Response",
            AttOpcode::WriteReq => "Write Request",
            AttOpcode::WriteRsp => "Write Response",
            AttOpcode::WriteCmd => "Write Command",
            AttOpcode::SignedWriteCmd => "Signed Write Command",
            AttOpcode::PrepareWriteReq => "Prepare Write Request",
            AttOpcode::PrepareWriteRsp => "Prepare Write Response",
            AttOpcode::ExecuteWriteReq => "Execute Write Request",
            AttOpcode::ExecuteWriteRsp => "Execute Write Response",
            AttOpcode::HandleValueNtf => "Handle Value Notification",
            AttOpcode::HandleValueInd => "Handle Value Indication",
            AttOpcode::HandleValueCfm => "Handle Value Confirmation",
        };
        write!(f, "{}", name)
    }
}

/// The ATT Protocol error codes
///
/// These are carried inside an Error Response PDU. Values 0x80-0x9F are
/// application level, 0xE0-0xFF are common profile and service error codes
/// from the Core Specification Supplement.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum ErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    DatabaseOutOfSync,
    ValueNotAllowed,
    /// 0x80-0x9F
    Application(u8),
    /// 0xE0-0xFF
    CommonProfileAndService(u8),
    /// Reserved for future use
    Reserved(u8),
}

impl ErrorCode {
    pub fn from_raw(val: u8) -> ErrorCode {
        match val {
            0x01 => ErrorCode::InvalidHandle,
            0x02 => ErrorCode::ReadNotPermitted,
            0x03 => ErrorCode::WriteNotPermitted,
            0x04 => ErrorCode::InvalidPdu,
            0x05 => ErrorCode::InsufficientAuthentication,
            0x06 => ErrorCode::RequestNotSupported,
            0x07 => ErrorCode::InvalidOffset,
            0x08 => ErrorCode::InsufficientAuthorization,
            0x09 => ErrorCode::PrepareQueueFull,
            0x0A => ErrorCode::AttributeNotFound,
            0x0B => ErrorCode::AttributeNotLong,
            0x0C => ErrorCode::InsufficientEncryptionKeySize,
            0x0D => ErrorCode::InvalidAttributeValueLength,
            0x0E => ErrorCode::UnlikelyError,
            0x0F => ErrorCode::InsufficientEncryption,
            0x10 => ErrorCode::UnsupportedGroupType,
            0x11 => ErrorCode::InsufficientResources,
            0x12 => ErrorCode::DatabaseOutOfSync,
            0x13 => ErrorCode::ValueNotAllowed,
            0x80..=0x9F => ErrorCode::Application(val),
            0xE0..=0xFF => ErrorCode::CommonProfileAndService(val),
            _ => ErrorCode::Reserved(val),
        }
    }

    pub fn to_raw(&self) -> u8 {
        match *self {
            ErrorCode::InvalidHandle => 0x01,
            ErrorCode::ReadNotPermitted => 0x02,
            ErrorCode::WriteNotPermitted => 0x03,
            ErrorCode::InvalidPdu => 0x04,
            ErrorCode::InsufficientAuthentication => 0x05,
            ErrorCode::RequestNotSupported => 0x06,
            ErrorCode::InvalidOffset => 0x07,
            ErrorCode::InsufficientAuthorization => 0x08,
            ErrorCode::PrepareQueueFull => 0x09,
            ErrorCode::AttributeNotFound => 0x0A,
            ErrorCode::AttributeNotLong => 0x0B,
            ErrorCode::InsufficientEncryptionKeySize => 0x0C,
            ErrorCode::InvalidAttributeValueLength => 0x0D,
            ErrorCode::UnlikelyError => 0x0E,
            ErrorCode::InsufficientEncryption => 0x0F,
            ErrorCode::UnsupportedGroupType => 0x10,
            ErrorCode::InsufficientResources => 0x11,
            ErrorCode::DatabaseOutOfSync => 0x12,
            ErrorCode::ValueNotAllowed => 0x13,
            ErrorCode::Application(val) => val,
            ErrorCode::CommonProfileAndService(val) => val,
            ErrorCode::Reserved(val) => val,
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ErrorCode::InvalidHandle => write!(f, "invalid attribute handle"),
            ErrorCode::ReadNotPermitted => write!(f, "attribute cannot be read"),
            ErrorCode::WriteNotPermitted => write!(f, "attribute cannot be written"),
            ErrorCode::InvalidPdu => write!(f, "invalid attribute PDU"),
            ErrorCode::InsufficientAuthentication => write!(f, "insufficient authentication"),
            ErrorCode::RequestNotSupported => write!(f, "request not supported by the server"),
            ErrorCode::InvalidOffset => write!(f, "offset past the end of the attribute"),
            ErrorCode::InsufficientAuthorization => write!(f, "insufficient authorization"),
            ErrorCode::PrepareQueueFull => write!(f, "prepare write queue is full"),
            ErrorCode::AttributeNotFound => write!(f, "no attribute within the handle range"),
            ErrorCode::AttributeNotLong => write!(f, "attribute cannot be read via read blob"),
            ErrorCode::InsufficientEncryptionKeySize => write!(f, "insufficient encryption key size"),
            ErrorCode::InvalidAttributeValueLength => write!(f, "invalid attribute value length"),
            ErrorCode::UnlikelyError => write!(f, "unlikely error"),
            ErrorCode::InsufficientEncryption => write!(f, "insufficient encryption"),
            ErrorCode::UnsupportedGroupType => write!(f, "unsupported grouping attribute type"),
            ErrorCode::InsufficientResources => write!(f, "insufficient resources"),
            ErrorCode::DatabaseOutOfSync => write!(f, "server database out of sync"),
            ErrorCode::ValueNotAllowed => write!(f, "value not allowed"),
            ErrorCode::Application(val) => write!(f, "application error {:#x}", val),
            ErrorCode::CommonProfileAndService(val) => write!(f, "profile/service error {:#x}", val),
            ErrorCode::Reserved(val) => write!(f, "reserved error {:#x}", val),
        }
    }
}

/// Codec level errors
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum Error {
    /// The PDU is shorter than its variant's declared minimum
    InvalidPdu { pdu: &'static str, min: usize, actual: usize },
    /// A list PDU payload is not divisible by its element size
    ElementSizeMismatch { value_size: usize, element_size: usize },
    /// A Find Information Response format byte other than 0x01 or 0x02
    InvalidFormat(u8),
    /// A field was accessed outside the frame
    Bounds(buffer::Error),
    /// A UUID width other than the 16 or 128 bit forms carried by ATT
    InvalidUuidWidth(usize),
    /// An element index past the element count
    ElementIndex { index: usize, count: usize },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::InvalidPdu { pdu, min, actual } =>
                write!(f, "invalid PDU: {} needs {} bytes, got {}", pdu, min, actual),
            Error::ElementSizeMismatch { value_size, element_size } =>
                write!(f, "value size {} not divisible by element size {}", value_size, element_size),
            Error::InvalidFormat(val) =>
                write!(f, "invalid format {:#x}", val),
            Error::Bounds(e) => write!(f, "{}", e),
            Error::InvalidUuidWidth(w) =>
                write!(f, "invalid uuid width {} (must be 2 or 16)", w),
            Error::ElementIndex { index, count } =>
                write!(f, "element index {} out of {} elements", index, count),
        }
    }
}

impl From<buffer::Error> for Error {
    fn from(e: buffer::Error) -> Error {
        Error::Bounds(e)
    }
}
