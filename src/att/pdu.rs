//! Attribute Protocol data units
//!
//! Every PDU variant is a typed struct owning its wire frame as an
//! [`Octets`] buffer; accessors read straight out of the frame, so parsing
//! is validation plus a tag, never a copy. [`AttPdu`] is the sum type over
//! all variants, discriminated by the opcode byte.
//!
//! A variant that serves both directions of an exchange (MTU request and
//! response, read and read blob responses, notification and indication)
//! accepts either opcode.
//!
//! The 12 byte authentication signature of a signed PDU (opcode bit 7) is
//! accounted in the frame size but never parsed; value accessors exclude it.

use core::convert::TryFrom;

use super::{AttOpcode, AUTH_SIG_SIZE, Error, ErrorCode};
use crate::buffer::Octets;
use crate::Uuid;

/// An unparsed PDU frame
///
/// This retains any received frame, including ones with unknown opcodes
/// (opcode 0x00 included) which pass through the stack opaquely for
/// debugging.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct RawPdu {
    frame: Octets,
}

impl RawPdu {
    pub fn new(frame: Octets) -> Result<RawPdu, Error> {
        if frame.size() >= 1 {
            Ok(RawPdu { frame })
        } else {
            Err(Error::InvalidPdu { pdu: "AttPdu", min: 1, actual: 0 })
        }
    }

    pub fn opcode_raw(&self) -> u8 {
        // A RawPdu is never empty
        self.frame.get_u8(0).unwrap_or(0)
    }

    pub fn opcode(&self) -> Option<AttOpcode> {
        AttOpcode::try_from(self.opcode_raw()).ok()
    }

    /// 12 when opcode bit 7 flags a trailing authentication signature
    pub fn auth_sig_size(&self) -> usize {
        if AttOpcode::has_auth_signature(self.opcode_raw()) { AUTH_SIG_SIZE } else { 0 }
    }

    pub fn pdu_size(&self) -> usize {
        self.frame.size()
    }

    /// `pdu_size - auth_sig_size - 1`
    ///
    /// Zero when the frame is shorter than its own framing overhead.
    pub fn param_size(&self) -> usize {
        self.frame.size().saturating_sub(1 + self.auth_sig_size())
    }

    fn require_param(&self, pdu: &'static str, min: usize) -> Result<(), Error> {
        if self.frame.size() < 1 + self.auth_sig_size()
            || self.param_size() < min
        {
            Err(Error::InvalidPdu { pdu, min: 1 + min + self.auth_sig_size(), actual: self.frame.size() })
        } else {
            Ok(())
        }
    }

    pub fn frame(&self) -> &Octets { &self.frame }

    pub fn into_frame(self) -> Octets { self.frame }
}

fn new_frame(op: AttOpcode, param_len: usize) -> Octets {
    let mut frame = Octets::zeroed(1 + param_len);

    // The frame was just allocated large enough
    frame.put_u8(0, op.into()).unwrap();
    frame
}

/// The width a UUID takes inside an ATT PDU, 2 or 16 bytes
///
/// The Attribute Protocol never carries the 32 bit shorthand.
fn att_uuid_width(uuid: Uuid) -> usize {
    if uuid.is_16_bit() { 2 } else { 16 }
}

fn put_att_uuid(frame: &mut Octets, offset: usize, uuid: Uuid) {
    if uuid.is_16_bit() {
        frame.put_uuid16(offset, uuid).unwrap();
    } else {
        frame.put_uuid128(offset, uuid).unwrap();
    }
}

/// Error Response
///
/// Sent by the server whenever a request cannot be performed. Carries the
/// opcode and handle of the offending request plus the [`ErrorCode`].
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ErrorRsp {
    raw: RawPdu,
}

impl ErrorRsp {
    pub fn new(caused_opcode: u8, caused_handle: u16, code: ErrorCode) -> Self {
        let mut frame = new_frame(AttOpcode::ErrorRsp, 4);

        frame.put_u8(1, caused_opcode).unwrap();
        frame.put_u16(2, caused_handle).unwrap();
        frame.put_u8(4, code.to_raw()).unwrap();

        ErrorRsp { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ErrorRsp", 4)?;
        Ok(ErrorRsp { raw })
    }

    pub fn caused_opcode(&self) -> u8 {
        self.raw.frame.get_u8(1).unwrap()
    }

    pub fn caused_handle(&self) -> u16 {
        self.raw.frame.get_u16(2).unwrap()
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_raw(self.raw.frame.get_u8(4).unwrap())
    }
}

/// Exchange MTU Request/Response
///
/// The same parameter layout serves both directions; the opcode tells the
/// requesting side apart.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ExchangeMtu {
    raw: RawPdu,
}

impl ExchangeMtu {
    pub fn new_req(mtu: u16) -> Self {
        let mut frame = new_frame(AttOpcode::ExchangeMtuReq, 2);
        frame.put_u16(1, mtu).unwrap();
        ExchangeMtu { raw: RawPdu { frame } }
    }

    pub fn new_rsp(mtu: u16) -> Self {
        let mut frame = new_frame(AttOpcode::ExchangeMtuRsp, 2);
        frame.put_u16(1, mtu).unwrap();
        ExchangeMtu { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ExchangeMtu", 2)?;
        Ok(ExchangeMtu { raw })
    }

    pub fn mtu(&self) -> u16 {
        self.raw.frame.get_u16(1).unwrap()
    }

    pub fn is_request(&self) -> bool {
        self.raw.opcode_raw() == AttOpcode::ExchangeMtuReq.into()
    }
}

/// Find Information Request
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct FindInfoReq {
    raw: RawPdu,
}

impl FindInfoReq {
    pub fn new(start_handle: u16, end_handle: u16) -> Self {
        let mut frame = new_frame(AttOpcode::FindInfoReq, 4);
        frame.put_u16(1, start_handle).unwrap();
        frame.put_u16(3, end_handle).unwrap();
        FindInfoReq { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("FindInfoReq", 4)?;
        Ok(FindInfoReq { raw })
    }

    pub fn start_handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn end_handle(&self) -> u16 { self.raw.frame.get_u16(3).unwrap() }
}

/// Find Information Response
///
/// Format 0x01 packs 4 byte elements (handle + 16 bit UUID), format 0x02
/// packs 18 byte elements (handle + 128 bit UUID). Any other format byte is
/// rejected at parse time.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct FindInfoRsp {
    raw: RawPdu,
}

impl FindInfoRsp {
    pub const FORMAT_UUID16: u8 = 0x01;
    pub const FORMAT_UUID128: u8 = 0x02;

    const VALUE_OFFSET: usize = 2;

    /// Start a response at its maximum size; finalize with
    /// [`set_element_count`](FindInfoRsp::set_element_count)
    pub fn alloc(format: u8, pdu_capacity: usize) -> Result<Self, Error> {
        if format != Self::FORMAT_UUID16 && format != Self::FORMAT_UUID128 {
            return Err(Error::InvalidFormat(format));
        }
        if pdu_capacity < Self::VALUE_OFFSET {
            return Err(Error::InvalidPdu {
                pdu: "FindInfoRsp", min: Self::VALUE_OFFSET, actual: pdu_capacity,
            });
        }

        let mut frame = Octets::zeroed(pdu_capacity);
        frame.put_u8(0, AttOpcode::FindInfoRsp.into()).unwrap();
        frame.put_u8(1, format).unwrap();

        Ok(FindInfoRsp { raw: RawPdu { frame } })
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("FindInfoRsp", 1 + 4)?;

        let rsp = FindInfoRsp { raw };
        let format = rsp.format();

        if format != Self::FORMAT_UUID16 && format != Self::FORMAT_UUID128 {
            return Err(Error::InvalidFormat(format));
        }

        let value_size = rsp.raw.pdu_size() - rsp.raw.auth_sig_size() - Self::VALUE_OFFSET;

        if value_size % rsp.element_size() != 0 {
            return Err(Error::ElementSizeMismatch {
                value_size, element_size: rsp.element_size(),
            });
        }

        Ok(rsp)
    }

    pub fn format(&self) -> u8 {
        self.raw.frame.get_u8(1).unwrap()
    }

    /// 4 for format 0x01, 18 for format 0x02
    pub fn element_size(&self) -> usize {
        if self.format() == Self::FORMAT_UUID16 { 4 } else { 18 }
    }

    pub fn element_count(&self) -> usize {
        (self.raw.pdu_size() - self.raw.auth_sig_size() - Self::VALUE_OFFSET) / self.element_size()
    }

    fn element_offset(&self, index: usize) -> Result<usize, Error> {
        if index < self.element_count() {
            Ok(Self::VALUE_OFFSET + index * self.element_size())
        } else {
            Err(Error::ElementIndex { index, count: self.element_count() })
        }
    }

    pub fn element_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)?)?)
    }

    pub fn element_uuid(&self, index: usize) -> Result<Uuid, Error> {
        let offset = self.element_offset(index)? + 2;

        if self.format() == Self::FORMAT_UUID16 {
            Ok(self.raw.frame.get_uuid16(offset)?)
        } else {
            Ok(self.raw.frame.get_uuid128(offset)?)
        }
    }

    pub fn set_element(&mut self, index: usize, handle: u16, uuid: Uuid) -> Result<(), Error> {
        let offset = self.element_offset(index)?;

        self.raw.frame.put_u16(offset, handle)?;

        if self.format() == Self::FORMAT_UUID16 {
            self.raw.frame.put_uuid16(offset + 2, uuid)?;
        } else {
            self.raw.frame.put_uuid128(offset + 2, uuid)?;
        }
        Ok(())
    }

    /// Finalize the response to exactly `count` elements
    pub fn set_element_count(&mut self, count: usize) -> Result<(), Error> {
        let new_size = Self::VALUE_OFFSET + count * self.element_size();

        self.raw.frame.resize(new_size)?;
        Ok(())
    }
}

/// Find By Type Value Request
///
/// Only 16 bit attribute types can be matched by value.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct FindByTypeValueReq {
    raw: RawPdu,
}

impl FindByTypeValueReq {
    pub fn new(start_handle: u16, end_handle: u16, attr_type: u16, value: &[u8]) -> Self {
        let mut frame = new_frame(AttOpcode::FindByTypeValueReq, 6 + value.len());

        frame.put_u16(1, start_handle).unwrap();
        frame.put_u16(3, end_handle).unwrap();
        frame.put_u16(5, attr_type).unwrap();
        frame.put_slice(7, value).unwrap();

        FindByTypeValueReq { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("FindByTypeValueReq", 6)?;
        Ok(FindByTypeValueReq { raw })
    }

    pub fn start_handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn end_handle(&self) -> u16 { self.raw.frame.get_u16(3).unwrap() }

    pub fn attr_type(&self) -> Uuid { self.raw.frame.get_uuid16(5).unwrap() }

    pub fn value(&self) -> &[u8] {
        let end = self.raw.pdu_size() - self.raw.auth_sig_size();
        self.raw.frame.get_slice(7, end - 7).unwrap()
    }
}

/// Find By Type Value Response
///
/// A list of `{found_handle, group_end_handle}` pairs, 4 bytes each.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct FindByTypeValueRsp {
    raw: RawPdu,
}

impl FindByTypeValueRsp {
    const VALUE_OFFSET: usize = 1;
    const ELEMENT_SIZE: usize = 4;

    pub fn alloc(pdu_capacity: usize) -> Result<Self, Error> {
        if pdu_capacity < Self::VALUE_OFFSET + Self::ELEMENT_SIZE {
            return Err(Error::InvalidPdu {
                pdu: "FindByTypeValueRsp",
                min: Self::VALUE_OFFSET + Self::ELEMENT_SIZE,
                actual: pdu_capacity,
            });
        }

        let mut frame = Octets::zeroed(pdu_capacity);
        frame.put_u8(0, AttOpcode::FindByTypeValueRsp.into()).unwrap();

        Ok(FindByTypeValueRsp { raw: RawPdu { frame } })
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("FindByTypeValueRsp", 4)?;

        let value_size = raw.param_size();

        if value_size % Self::ELEMENT_SIZE != 0 {
            return Err(Error::ElementSizeMismatch {
                value_size, element_size: Self::ELEMENT_SIZE,
            });
        }

        Ok(FindByTypeValueRsp { raw })
    }

    pub fn element_count(&self) -> usize {
        (self.raw.pdu_size() - self.raw.auth_sig_size() - Self::VALUE_OFFSET) / Self::ELEMENT_SIZE
    }

    fn element_offset(&self, index: usize) -> Result<usize, Error> {
        if index < self.element_count() {
            Ok(Self::VALUE_OFFSET + index * Self::ELEMENT_SIZE)
        } else {
            Err(Error::ElementIndex { index, count: self.element_count() })
        }
    }

    pub fn found_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)?)?)
    }

    pub fn group_end_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)? + 2)?)
    }

    pub fn set_element(&mut self, index: usize, found: u16, group_end: u16) -> Result<(), Error> {
        let offset = self.element_offset(index)?;

        self.raw.frame.put_u16(offset, found)?;
        self.raw.frame.put_u16(offset + 2, group_end)?;
        Ok(())
    }

    pub fn set_element_count(&mut self, count: usize) -> Result<(), Error> {
        self.raw.frame.resize(Self::VALUE_OFFSET + count * Self::ELEMENT_SIZE)?;
        Ok(())
    }
}

/// Read By Type / Read By Group Type Request
///
/// Both requests share the `{start, end, type}` layout; the attribute type
/// is either a 16 bit shorthand or a full 128 bit UUID. The 32 bit UUID
/// shorthand is not an ATT wire format and is rejected.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct TypeReq {
    raw: RawPdu,
}

impl TypeReq {
    fn build(op: AttOpcode, start: u16, end: u16, attr_type: Uuid) -> Self {
        let mut frame = new_frame(op, 4 + att_uuid_width(attr_type));

        frame.put_u16(1, start).unwrap();
        frame.put_u16(3, end).unwrap();
        put_att_uuid(&mut frame, 5, attr_type);

        TypeReq { raw: RawPdu { frame } }
    }

    pub fn new_read_by_type(start: u16, end: u16, attr_type: Uuid) -> Self {
        Self::build(AttOpcode::ReadByTypeReq, start, end, attr_type)
    }

    pub fn new_read_by_group_type(start: u16, end: u16, group_type: Uuid) -> Self {
        Self::build(AttOpcode::ReadByGroupTypeReq, start, end, group_type)
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("TypeReq", 6)?;

        match raw.param_size() {
            6 | 20 => Ok(TypeReq { raw }),
            n => Err(Error::InvalidUuidWidth(n - 4)),
        }
    }

    pub fn start_handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn end_handle(&self) -> u16 { self.raw.frame.get_u16(3).unwrap() }

    pub fn attr_type(&self) -> Uuid {
        if self.raw.param_size() == 6 {
            self.raw.frame.get_uuid16(5).unwrap()
        } else {
            self.raw.frame.get_uuid128(5).unwrap()
        }
    }
}

/// Read By Type Response
///
/// `{opcode, element_size, element[N]}` with `element = {handle, value}`.
/// All elements share one size; the payload must divide evenly.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ReadByTypeRsp {
    raw: RawPdu,
}

impl ReadByTypeRsp {
    const VALUE_OFFSET: usize = 2;
    const ELEMENT_HEAD: usize = 2;

    pub fn alloc(element_size: u8, pdu_capacity: usize) -> Result<Self, Error> {
        if (element_size as usize) <= Self::ELEMENT_HEAD {
            return Err(Error::ElementSizeMismatch {
                value_size: 0, element_size: element_size as usize,
            });
        }
        if pdu_capacity < Self::VALUE_OFFSET + element_size as usize {
            return Err(Error::InvalidPdu {
                pdu: "ReadByTypeRsp",
                min: Self::VALUE_OFFSET + element_size as usize,
                actual: pdu_capacity,
            });
        }

        let mut frame = Octets::zeroed(pdu_capacity);
        frame.put_u8(0, AttOpcode::ReadByTypeRsp.into()).unwrap();
        frame.put_u8(1, element_size).unwrap();

        Ok(ReadByTypeRsp { raw: RawPdu { frame } })
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ReadByTypeRsp", 1 + 3)?;

        let rsp = ReadByTypeRsp { raw };
        let element_size = rsp.element_size();
        let value_size = rsp.value_size();

        if element_size <= Self::ELEMENT_HEAD || value_size % element_size != 0 {
            return Err(Error::ElementSizeMismatch { value_size, element_size });
        }

        Ok(rsp)
    }

    fn value_size(&self) -> usize {
        self.raw.pdu_size() - self.raw.auth_sig_size() - Self::VALUE_OFFSET
    }

    pub fn element_size(&self) -> usize {
        self.raw.frame.get_u8(1).unwrap() as usize
    }

    pub fn element_count(&self) -> usize {
        self.value_size() / self.element_size()
    }

    fn element_offset(&self, index: usize) -> Result<usize, Error> {
        if index < self.element_count() {
            Ok(Self::VALUE_OFFSET + index * self.element_size())
        } else {
            Err(Error::ElementIndex { index, count: self.element_count() })
        }
    }

    pub fn element_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)?)?)
    }

    pub fn element_value(&self, index: usize) -> Result<&[u8], Error> {
        let offset = self.element_offset(index)? + Self::ELEMENT_HEAD;
        Ok(self.raw.frame.get_slice(offset, self.element_size() - Self::ELEMENT_HEAD)?)
    }

    pub fn set_element_handle(&mut self, index: usize, handle: u16) -> Result<(), Error> {
        let offset = self.element_offset(index)?;
        self.raw.frame.put_u16(offset, handle)?;
        Ok(())
    }

    pub fn set_element_value(&mut self, index: usize, value: &[u8]) -> Result<(), Error> {
        if value.len() != self.element_size() - Self::ELEMENT_HEAD {
            return Err(Error::ElementSizeMismatch {
                value_size: value.len(), element_size: self.element_size(),
            });
        }

        let offset = self.element_offset(index)? + Self::ELEMENT_HEAD;
        self.raw.frame.put_slice(offset, value)?;
        Ok(())
    }

    /// Finalize the response to exactly `count` elements
    pub fn set_element_count(&mut self, count: usize) -> Result<(), Error> {
        self.raw.frame.resize(Self::VALUE_OFFSET + count * self.element_size())?;
        Ok(())
    }
}

/// Read By Group Type Response
///
/// Like [`ReadByTypeRsp`] with a `{handle, end_group_handle}` element head.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ReadByGroupTypeRsp {
    raw: RawPdu,
}

impl ReadByGroupTypeRsp {
    const VALUE_OFFSET: usize = 2;
    const ELEMENT_HEAD: usize = 4;

    pub fn alloc(element_size: u8, pdu_capacity: usize) -> Result<Self, Error> {
        if (element_size as usize) <= Self::ELEMENT_HEAD {
            return Err(Error::ElementSizeMismatch {
                value_size: 0, element_size: element_size as usize,
            });
        }
        if pdu_capacity < Self::VALUE_OFFSET + element_size as usize {
            return Err(Error::InvalidPdu {
                pdu: "ReadByGroupTypeRsp",
                min: Self::VALUE_OFFSET + element_size as usize,
                actual: pdu_capacity,
            });
        }

        let mut frame = Octets::zeroed(pdu_capacity);
        frame.put_u8(0, AttOpcode::ReadByGroupTypeRsp.into()).unwrap();
        frame.put_u8(1, element_size).unwrap();

        Ok(ReadByGroupTypeRsp { raw: RawPdu { frame } })
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ReadByGroupTypeRsp", 1 + 5)?;

        let rsp = ReadByGroupTypeRsp { raw };
        let element_size = rsp.element_size();
        let value_size = rsp.value_size();

        if element_size <= Self::ELEMENT_HEAD || value_size % element_size != 0 {
            return Err(Error::ElementSizeMismatch { value_size, element_size });
        }

        Ok(rsp)
    }

    fn value_size(&self) -> usize {
        self.raw.pdu_size() - self.raw.auth_sig_size() - Self::VALUE_OFFSET
    }

    pub fn element_size(&self) -> usize {
        self.raw.frame.get_u8(1).unwrap() as usize
    }

    pub fn element_count(&self) -> usize {
        self.value_size() / self.element_size()
    }

    fn element_offset(&self, index: usize) -> Result<usize, Error> {
        if index < self.element_count() {
            Ok(Self::VALUE_OFFSET + index * self.element_size())
        } else {
            Err(Error::ElementIndex { index, count: self.element_count() })
        }
    }

    pub fn element_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)?)?)
    }

    pub fn element_end_handle(&self, index: usize) -> Result<u16, Error> {
        Ok(self.raw.frame.get_u16(self.element_offset(index)? + 2)?)
    }

    pub fn element_value(&self, index: usize) -> Result<&[u8], Error> {
        let offset = self.element_offset(index)? + Self::ELEMENT_HEAD;
        Ok(self.raw.frame.get_slice(offset, self.element_size() - Self::ELEMENT_HEAD)?)
    }

    pub fn set_element_handle(&mut self, index: usize, handle: u16) -> Result<(), Error> {
        let offset = self.element_offset(index)?;
        self.raw.frame.put_u16(offset, handle)?;
        Ok(())
    }

    pub fn set_element_end_handle(&mut self, index: usize, end_handle: u16) -> Result<(), Error> {
        let offset = self.element_offset(index)? + 2;
        self.raw.frame.put_u16(offset, end_handle)?;
        Ok(())
    }

    pub fn set_element_value(&mut self, index: usize, value: &[u8]) -> Result<(), Error> {
        if value.len() != self.element_size() - Self::ELEMENT_HEAD {
            return Err(Error::ElementSizeMismatch {
                value_size: value.len(), element_size: self.element_size(),
            });
        }

        let offset = self.element_offset(index)? + Self::ELEMENT_HEAD;
        self.raw.frame.put_slice(offset, value)?;
        Ok(())
    }

    pub fn set_element_count(&mut self, count: usize) -> Result<(), Error> {
        self.raw.frame.resize(Self::VALUE_OFFSET + count * self.element_size())?;
        Ok(())
    }
}

/// Read Request
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ReadReq {
    raw: RawPdu,
}

impl ReadReq {
    pub fn new(handle: u16) -> Self {
        let mut frame = new_frame(AttOpcode::ReadReq, 2);
        frame.put_u16(1, handle).unwrap();
        ReadReq { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ReadReq", 2)?;
        Ok(ReadReq { raw })
    }

    pub fn handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }
}

/// Read Blob Request
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ReadBlobReq {
    raw: RawPdu,
}

impl ReadBlobReq {
    pub fn new(handle: u16, offset: u16) -> Self {
        let mut frame = new_frame(AttOpcode::ReadBlobReq, 4);
        frame.put_u16(1, handle).unwrap();
        frame.put_u16(3, offset).unwrap();
        ReadBlobReq { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ReadBlobReq", 4)?;
        Ok(ReadBlobReq { raw })
    }

    pub fn handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn offset(&self) -> u16 { self.raw.frame.get_u16(3).unwrap() }
}

/// Read Response / Read Blob Response
///
/// The value is the raw tail after the opcode; it may be empty.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ReadRsp {
    raw: RawPdu,
}

impl ReadRsp {
    const VALUE_OFFSET: usize = 1;

    pub fn new_read(value: &[u8]) -> Self {
        let mut frame = new_frame(AttOpcode::ReadRsp, value.len());
        frame.put_slice(1, value).unwrap();
        ReadRsp { raw: RawPdu { frame } }
    }

    pub fn new_blob(value: &[u8]) -> Self {
        let mut frame = new_frame(AttOpcode::ReadBlobRsp, value.len());
        frame.put_slice(1, value).unwrap();
        ReadRsp { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ReadRsp", 0)?;
        Ok(ReadRsp { raw })
    }

    pub fn value(&self) -> &[u8] {
        let end = self.raw.pdu_size() - self.raw.auth_sig_size();
        self.raw.frame.get_slice(Self::VALUE_OFFSET, end - Self::VALUE_OFFSET).unwrap()
    }
}

/// Write Request / Write Command / Signed Write Command /
/// Handle Value Notification / Handle Value Indication
///
/// All five share the `{handle, value}` parameter layout. The signed write
/// form carries the 12 byte authentication signature after the value, which
/// [`value`](HandleValuePdu::value) excludes.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct HandleValuePdu {
    raw: RawPdu,
}

impl HandleValuePdu {
    const VALUE_OFFSET: usize = 3;

    fn build(op: AttOpcode, handle: u16, value: &[u8], sig: Option<&[u8; AUTH_SIG_SIZE]>) -> Self {
        let sig_len = if sig.is_some() { AUTH_SIG_SIZE } else { 0 };
        let mut frame = new_frame(op, 2 + value.len() + sig_len);

        frame.put_u16(1, handle).unwrap();
        frame.put_slice(3, value).unwrap();

        if let Some(sig) = sig {
            frame.put_slice(3 + value.len(), &sig[..]).unwrap();
        }

        HandleValuePdu { raw: RawPdu { frame } }
    }

    pub fn new_write_req(handle: u16, value: &[u8]) -> Self {
        Self::build(AttOpcode::WriteReq, handle, value, None)
    }

    pub fn new_write_cmd(handle: u16, value: &[u8]) -> Self {
        Self::build(AttOpcode::WriteCmd, handle, value, None)
    }

    pub fn new_signed_write_cmd(handle: u16, value: &[u8], sig: &[u8; AUTH_SIG_SIZE]) -> Self {
        Self::build(AttOpcode::SignedWriteCmd, handle, value, Some(sig))
    }

    pub fn new_notification(handle: u16, value: &[u8]) -> Self {
        Self::build(AttOpcode::HandleValueNtf, handle, value, None)
    }

    pub fn new_indication(handle: u16, value: &[u8]) -> Self {
        Self::build(AttOpcode::HandleValueInd, handle, value, None)
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("HandleValuePdu", 2)?;
        Ok(HandleValuePdu { raw })
    }

    pub fn handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn value(&self) -> &[u8] {
        let end = self.raw.pdu_size() - self.raw.auth_sig_size();
        self.raw.frame.get_slice(Self::VALUE_OFFSET, end - Self::VALUE_OFFSET).unwrap()
    }
}

/// Write Response, an empty parameter PDU
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct WriteRsp {
    raw: RawPdu,
}

impl WriteRsp {
    pub fn new() -> Self {
        WriteRsp { raw: RawPdu { frame: new_frame(AttOpcode::WriteRsp, 0) } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("WriteRsp", 0)?;
        Ok(WriteRsp { raw })
    }
}

/// Prepare Write Request/Response
///
/// The response echoes the request parameters, so one layout serves both.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct PrepareWrite {
    raw: RawPdu,
}

impl PrepareWrite {
    const VALUE_OFFSET: usize = 5;

    fn build(op: AttOpcode, handle: u16, offset: u16, chunk: &[u8]) -> Self {
        let mut frame = new_frame(op, 4 + chunk.len());

        frame.put_u16(1, handle).unwrap();
        frame.put_u16(3, offset).unwrap();
        frame.put_slice(5, chunk).unwrap();

        PrepareWrite { raw: RawPdu { frame } }
    }

    pub fn new_req(handle: u16, offset: u16, chunk: &[u8]) -> Self {
        Self::build(AttOpcode::PrepareWriteReq, handle, offset, chunk)
    }

    pub fn new_rsp(handle: u16, offset: u16, chunk: &[u8]) -> Self {
        Self::build(AttOpcode::PrepareWriteRsp, handle, offset, chunk)
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("PrepareWrite", 4)?;
        Ok(PrepareWrite { raw })
    }

    pub fn handle(&self) -> u16 { self.raw.frame.get_u16(1).unwrap() }

    pub fn offset(&self) -> u16 { self.raw.frame.get_u16(3).unwrap() }

    pub fn value(&self) -> &[u8] {
        let end = self.raw.pdu_size() - self.raw.auth_sig_size();
        self.raw.frame.get_slice(Self::VALUE_OFFSET, end - Self::VALUE_OFFSET).unwrap()
    }
}

/// Execute Write Request
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ExecuteWriteReq {
    raw: RawPdu,
}

impl ExecuteWriteReq {
    /// `execute` true flushes the queue, false cancels it
    pub fn new(execute: bool) -> Self {
        let mut frame = new_frame(AttOpcode::ExecuteWriteReq, 1);
        frame.put_u8(1, if execute { 0x01 } else { 0x00 }).unwrap();
        ExecuteWriteReq { raw: RawPdu { frame } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ExecuteWriteReq", 1)?;
        Ok(ExecuteWriteReq { raw })
    }

    pub fn execute(&self) -> bool {
        self.raw.frame.get_u8(1).unwrap() != 0
    }
}

/// Execute Write Response, an empty parameter PDU
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ExecuteWriteRsp {
    raw: RawPdu,
}

impl ExecuteWriteRsp {
    pub fn new() -> Self {
        ExecuteWriteRsp { raw: RawPdu { frame: new_frame(AttOpcode::ExecuteWriteRsp, 0) } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("ExecuteWriteRsp", 0)?;
        Ok(ExecuteWriteRsp { raw })
    }
}

/// Handle Value Confirmation, the client's answer to an indication
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct HandleValueCfm {
    raw: RawPdu,
}

impl HandleValueCfm {
    pub fn new() -> Self {
        HandleValueCfm { raw: RawPdu { frame: new_frame(AttOpcode::HandleValueCfm, 0) } }
    }

    fn from_raw(raw: RawPdu) -> Result<Self, Error> {
        raw.require_param("HandleValueCfm", 0)?;
        Ok(HandleValueCfm { raw })
    }
}

/// Any Attribute Protocol data unit
///
/// The opcode byte discriminates the variant. Unknown opcodes parse into
/// [`AttPdu::Unknown`] keeping the raw frame.
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum AttPdu {
    ErrorRsp(ErrorRsp),
    ExchangeMtuReq(ExchangeMtu),
    ExchangeMtuRsp(ExchangeMtu),
    FindInfoReq(FindInfoReq),
    FindInfoRsp(FindInfoRsp),
    FindByTypeValueReq(FindByTypeValueReq),
    FindByTypeValueRsp(FindByTypeValueRsp),
    ReadByTypeReq(TypeReq),
    ReadByTypeRsp(ReadByTypeRsp),
    ReadReq(ReadReq),
    ReadRsp(ReadRsp),
    ReadBlobReq(ReadBlobReq),
    ReadBlobRsp(ReadRsp),
    ReadByGroupTypeReq(TypeReq),
    ReadByGroupTypeRsp(ReadByGroupTypeRsp),
    WriteReq(HandleValuePdu),
    WriteRsp(WriteRsp),
    WriteCmd(HandleValuePdu),
    SignedWriteCmd(HandleValuePdu),
    PrepareWriteReq(PrepareWrite),
    PrepareWriteRsp(PrepareWrite),
    ExecuteWriteReq(ExecuteWriteReq),
    ExecuteWriteRsp(ExecuteWriteRsp),
    HandleValueNtf(HandleValuePdu),
    HandleValueInd(HandleValuePdu),
    HandleValueCfm(HandleValueCfm),
    Unknown(RawPdu),
}

impl AttPdu {
    /// Parse a received frame
    ///
    /// The first byte selects the variant; the variant constructor verifies
    /// its declared minimum size. Unknown opcodes never fail, they keep the
    /// frame opaquely.
    pub fn parse(frame: Octets) -> Result<AttPdu, Error> {
        let raw = RawPdu::new(frame)?;

        match AttOpcode::try_from(raw.opcode_raw()) {
            Ok(AttOpcode::ErrorRsp) => Ok(AttPdu::ErrorRsp(ErrorRsp::from_raw(raw)?)),
            Ok(AttOpcode::ExchangeMtuReq) => Ok(AttPdu::ExchangeMtuReq(ExchangeMtu::from_raw(raw)?)),
            Ok(AttOpcode::ExchangeMtuRsp) => Ok(AttPdu::ExchangeMtuRsp(ExchangeMtu::from_raw(raw)?)),
            Ok(AttOpcode::FindInfoReq) => Ok(AttPdu::FindInfoReq(FindInfoReq::from_raw(raw)?)),
            Ok(AttOpcode::FindInfoRsp) => Ok(AttPdu::FindInfoRsp(FindInfoRsp::from_raw(raw)?)),
            Ok(AttOpcode::FindByTypeValueReq) =>
                Ok(AttPdu::FindByTypeValueReq(FindByTypeValueReq::from_raw(raw)?)),
            Ok(AttOpcode::FindByTypeValueRsp) =>
                Ok(AttPdu::FindByTypeValueRsp(FindByTypeValueRsp::from_raw(raw)?)),
            Ok(AttOpcode::ReadByTypeReq) => Ok(AttPdu::ReadByTypeReq(TypeReq::from_raw(raw)?)),
            Ok(AttOpcode::ReadByTypeRsp) => Ok(AttPdu::ReadByTypeRsp(ReadByTypeRsp::from_raw(raw)?)),
            Ok(AttOpcode::ReadReq) => Ok(AttPdu::ReadReq(ReadReq::from_raw(raw)?)),
            Ok(AttOpcode::ReadRsp) => Ok(AttPdu::ReadRsp(ReadRsp::from_raw(raw)?)),
            Ok(AttOpcode::ReadBlobReq) => Ok(AttPdu::ReadBlobReq(ReadBlobReq::from_raw(raw)?)),
            Ok(AttOpcode::ReadBlobRsp) => Ok(AttPdu::ReadBlobRsp(ReadRsp::from_raw(raw)?)),
            Ok(AttOpcode::ReadByGroupTypeReq) =>
                Ok(AttPdu::ReadByGroupTypeReq(TypeReq::from_raw(raw)?)),
            Ok(AttOpcode::ReadByGroupTypeRsp) =>
                Ok(AttPdu::ReadByGroupTypeRsp(ReadByGroupTypeRsp::from_raw(raw)?)),
            Ok(AttOpcode::WriteReq) => Ok(AttPdu::WriteReq(HandleValuePdu::from_raw(raw)?)),
            Ok(AttOpcode::WriteRsp) => Ok(AttPdu::WriteRsp(WriteRsp::from_raw(raw)?)),
            Ok(AttOpcode::WriteCmd) => Ok(AttPdu::WriteCmd(HandleValuePdu::from_raw(raw)?)),
            Ok(AttOpcode::SignedWriteCmd) =>
                Ok(AttPdu::SignedWriteCmd(HandleValuePdu::from_raw(raw)?)),
            Ok(AttOpcode::PrepareWriteReq) =>
                Ok(AttPdu::PrepareWriteReq(PrepareWrite::from_raw(raw)?)),
            Ok(AttOpcode::PrepareWriteRsp) =>
                Ok(AttPdu::PrepareWriteRsp(PrepareWrite::from_raw(raw)?)),
            Ok(AttOpcode::ExecuteWriteReq) =>
                Ok(AttPdu::ExecuteWriteReq(ExecuteWriteReq::from_raw(raw)?)),
            Ok(AttOpcode::ExecuteWriteRsp) =>
                Ok(AttPdu::ExecuteWriteRsp(ExecuteWriteRsp::from_raw(raw)?)),
            Ok(AttOpcode::HandleValueNtf) =>
                Ok(AttPdu::HandleValueNtf(HandleValuePdu::from_raw(raw)?)),
            Ok(AttOpcode::HandleValueInd) =>
                Ok(AttPdu::HandleValueInd(HandleValuePdu::from_raw(raw)?)),
            Ok(AttOpcode::HandleValueCfm) =>
                Ok(AttPdu::HandleValueCfm(HandleValueCfm::from_raw(raw)?)),
            Err(_) => Ok(AttPdu::Unknown(raw)),
        }
    }

    fn raw(&self) -> &RawPdu {
        match self {
            AttPdu::ErrorRsp(p) => &p.raw,
            AttPdu::ExchangeMtuReq(p) | AttPdu::ExchangeMtuRsp(p) => &p.raw,
            AttPdu::FindInfoReq(p) => &p.raw,
            AttPdu::FindInfoRsp(p) => &p.raw,
            AttPdu::FindByTypeValueReq(p) => &p.raw,
            AttPdu::FindByTypeValueRsp(p) => &p.raw,
            AttPdu::ReadByTypeReq(p) | AttPdu::ReadByGroupTypeReq(p) => &p.raw,
            AttPdu::ReadByTypeRsp(p) => &p.raw,
            AttPdu::ReadReq(p) => &p.raw,
            AttPdu::ReadRsp(p) | AttPdu::ReadBlobRsp(p) => &p.raw,
            AttPdu::ReadBlobReq(p) => &p.raw,
            AttPdu::ReadByGroupTypeRsp(p) => &p.raw,
            AttPdu::WriteReq(p) | AttPdu::WriteCmd(p) | AttPdu::SignedWriteCmd(p) => &p.raw,
            AttPdu::WriteRsp(p) => &p.raw,
            AttPdu::PrepareWriteReq(p) | AttPdu::PrepareWriteRsp(p) => &p.raw,
            AttPdu::ExecuteWriteReq(p) => &p.raw,
            AttPdu::ExecuteWriteRsp(p) => &p.raw,
            AttPdu::HandleValueNtf(p) | AttPdu::HandleValueInd(p) => &p.raw,
            AttPdu::HandleValueCfm(p) => &p.raw,
            AttPdu::Unknown(raw) => raw,
        }
    }

    pub fn opcode_raw(&self) -> u8 {
        self.raw().opcode_raw()
    }

    pub fn opcode(&self) -> Option<AttOpcode> {
        self.raw().opcode()
    }

    pub fn pdu_size(&self) -> usize {
        self.raw().pdu_size()
    }

    /// The wire bytes of this PDU
    pub fn bytes(&self) -> &[u8] {
        self.raw().frame().as_ref()
    }

    /// Whether this PDU answers the request with method `request_opcode`
    ///
    /// A match is the request's response opcode, or an error response whose
    /// caused-opcode equals the request.
    pub fn answers(&self, request_opcode: AttOpcode) -> bool {
        match self {
            AttPdu::ErrorRsp(err) => err.caused_opcode() == request_opcode.into(),
            other => match (other.opcode(), request_opcode.response_opcode()) {
                (Some(op), Some(expected)) => op == expected,
                _ => false,
            },
        }
    }
}

impl core::fmt::Display for AttPdu {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{} [{} bytes]", op, self.pdu_size()),
            None => {
                write!(f, "Unknown PDU {:#04x} [", self.opcode_raw())?;
                for b in self.bytes() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(bytes: &[u8]) -> AttPdu {
        AttPdu::parse(Octets::from_slice(bytes)).expect("parse failed")
    }

    #[test]
    fn error_rsp_round_trip() {
        let pdu = ErrorRsp::new(0x10, 0x0015, ErrorCode::AttributeNotFound);

        assert_eq!(&[0x01, 0x10, 0x15, 0x00, 0x0A], pdu.raw.frame().as_ref());

        match parse(&[0x01, 0x10, 0x15, 0x00, 0x0A]) {
            AttPdu::ErrorRsp(e) => {
                assert_eq!(0x10, e.caused_opcode());
                assert_eq!(0x0015, e.caused_handle());
                assert_eq!(ErrorCode::AttributeNotFound, e.code());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn error_rsp_too_short() {
        assert!(AttPdu::parse(Octets::from_slice(&[0x01, 0x10, 0x15])).is_err());
    }

    #[test]
    fn exchange_mtu_both_directions() {
        match parse(&[0x02, 0x05, 0x02]) {
            AttPdu::ExchangeMtuReq(m) => {
                assert_eq!(517, m.mtu());
                assert!(m.is_request());
            }
            other => panic!("wrong variant {}", other),
        }

        match parse(&[0x03, 0x64, 0x00]) {
            AttPdu::ExchangeMtuRsp(m) => {
                assert_eq!(100, m.mtu());
                assert!(!m.is_request());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn read_by_group_type_rsp_two_services() {
        // S1 shape: element size 6, two 16 bit service UUIDs
        let mut rsp = ReadByGroupTypeRsp::alloc(6, 2 + 2 * 6).unwrap();

        rsp.set_element_handle(0, 0x0001).unwrap();
        rsp.set_element_end_handle(0, 0x0005).unwrap();
        rsp.set_element_value(0, &0x1800u16.to_le_bytes()).unwrap();
        rsp.set_element_handle(1, 0x0010).unwrap();
        rsp.set_element_end_handle(1, 0x0014).unwrap();
        rsp.set_element_value(1, &0x180Fu16.to_le_bytes()).unwrap();
        rsp.set_element_count(2).unwrap();

        let bytes = rsp.raw.frame().as_ref().to_vec();

        assert_eq!(2 + 12, bytes.len());

        match parse(&bytes) {
            AttPdu::ReadByGroupTypeRsp(r) => {
                assert_eq!(2, r.element_count());
                assert_eq!(0x0001, r.element_handle(0).unwrap());
                assert_eq!(0x0005, r.element_end_handle(0).unwrap());
                assert_eq!(&0x1800u16.to_le_bytes(), r.element_value(0).unwrap());
                assert_eq!(0x0010, r.element_handle(1).unwrap());
                assert_eq!(0x0014, r.element_end_handle(1).unwrap());
                assert!(r.element_handle(2).is_err());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn element_list_divisibility_enforced() {
        // element size 6 declared, 7 bytes of elements
        let mut bytes = alloc::vec![0x11u8, 6];
        bytes.extend_from_slice(&[0u8; 7]);

        assert_eq!(
            Err(Error::ElementSizeMismatch { value_size: 7, element_size: 6 }),
            AttPdu::parse(Octets::from_slice(&bytes))
        );
    }

    #[test]
    fn find_info_rsp_formats() {
        let mut rsp = FindInfoRsp::alloc(FindInfoRsp::FORMAT_UUID16, 2 + 2 * 4).unwrap();

        rsp.set_element(0, 0x0005, Uuid::from_u16(0x2902)).unwrap();
        rsp.set_element(1, 0x0006, Uuid::from_u16(0x2901)).unwrap();
        rsp.set_element_count(2).unwrap();

        match parse(rsp.raw.frame().as_ref()) {
            AttPdu::FindInfoRsp(r) => {
                assert_eq!(2, r.element_count());
                assert_eq!(0x0005, r.element_handle(0).unwrap());
                assert_eq!(Uuid::from_u16(0x2902), r.element_uuid(0).unwrap());
                assert_eq!(Uuid::from_u16(0x2901), r.element_uuid(1).unwrap());
            }
            other => panic!("wrong variant {}", other),
        }

        // format 0x02, one 128 bit element
        let uuid = Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10);
        let mut rsp = FindInfoRsp::alloc(FindInfoRsp::FORMAT_UUID128, 2 + 18).unwrap();

        rsp.set_element(0, 0x0021, uuid).unwrap();
        rsp.set_element_count(1).unwrap();

        match parse(rsp.raw.frame().as_ref()) {
            AttPdu::FindInfoRsp(r) => {
                assert_eq!(18, r.element_size());
                assert_eq!(uuid, r.element_uuid(0).unwrap());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn find_info_rsp_bad_format() {
        assert_eq!(
            Err(Error::InvalidFormat(0x03)),
            AttPdu::parse(Octets::from_slice(&[0x05, 0x03, 0, 0, 0, 0]))
        );
        assert!(FindInfoRsp::alloc(0x00, 32).is_err());
    }

    #[test]
    fn read_by_type_req_rejects_uuid32_width() {
        // 4 byte uuid field is neither the 2 nor the 16 byte wire form
        let mut bytes = alloc::vec![0x08u8, 0x01, 0x00, 0xFF, 0xFF];
        bytes.extend_from_slice(&[0xAA; 4]);

        assert_eq!(
            Err(Error::InvalidUuidWidth(4)),
            AttPdu::parse(Octets::from_slice(&bytes))
        );
    }

    #[test]
    fn read_by_type_req_uuid128() {
        let uuid = Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10);
        let req = TypeReq::new_read_by_type(0x0001, 0x0010, uuid);

        assert_eq!(1 + 4 + 16, req.raw.pdu_size());

        match parse(req.raw.frame().as_ref()) {
            AttPdu::ReadByTypeReq(r) => {
                assert_eq!(0x0001, r.start_handle());
                assert_eq!(0x0010, r.end_handle());
                assert_eq!(uuid, r.attr_type());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn write_rsp_has_empty_value() {
        match parse(&[0x13]) {
            AttPdu::WriteRsp(_) => (),
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn signed_write_value_excludes_signature() {
        let sig = [0xEE; AUTH_SIG_SIZE];
        let pdu = HandleValuePdu::new_signed_write_cmd(0x0030, b"abc", &sig);

        assert_eq!(1 + 2 + 3 + 12, pdu.raw.pdu_size());
        assert_eq!(b"abc", pdu.value());

        match parse(pdu.raw.frame().as_ref()) {
            AttPdu::SignedWriteCmd(p) => {
                assert_eq!(0x0030, p.handle());
                assert_eq!(b"abc", p.value());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn notification_and_indication() {
        let ntf = HandleValuePdu::new_notification(0x0030, b"ping");
        let ind = HandleValuePdu::new_indication(0x0030, b"ping");

        assert_eq!(0x1B, ntf.raw.opcode_raw());
        assert_eq!(0x1D, ind.raw.opcode_raw());

        match parse(ind.raw.frame().as_ref()) {
            AttPdu::HandleValueInd(p) => assert_eq!(b"ping", p.value()),
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn confirmation_is_bare_opcode() {
        let cfm = HandleValueCfm::new();

        assert_eq!(&[0x1E], cfm.raw.frame().as_ref());
    }

    #[test]
    fn prepare_write_round_trip() {
        let req = PrepareWrite::new_req(0x0030, 8, b"ef");

        match parse(req.raw.frame().as_ref()) {
            AttPdu::PrepareWriteReq(p) => {
                assert_eq!(0x0030, p.handle());
                assert_eq!(8, p.offset());
                assert_eq!(b"ef", p.value());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn execute_write_flag() {
        match parse(&[0x18, 0x01]) {
            AttPdu::ExecuteWriteReq(e) => assert!(e.execute()),
            other => panic!("wrong variant {}", other),
        }
        match parse(&[0x18, 0x00]) {
            AttPdu::ExecuteWriteReq(e) => assert!(!e.execute()),
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        // 0x00 is PDU_UNDEFINED; it passes through opaquely
        match parse(&[0x00, 0xDE, 0xAD]) {
            AttPdu::Unknown(raw) => {
                assert_eq!(0x00, raw.opcode_raw());
                assert_eq!(&[0x00, 0xDE, 0xAD], raw.frame().as_ref());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn reply_matching() {
        let write_rsp = parse(&[0x13]);

        assert!(write_rsp.answers(AttOpcode::WriteReq));
        assert!(!write_rsp.answers(AttOpcode::ReadReq));

        let err = parse(&[0x01, 0x12, 0x30, 0x00, 0x03]);

        assert!(err.answers(AttOpcode::WriteReq));
        assert!(!err.answers(AttOpcode::ReadReq));
    }

    #[test]
    fn read_rsp_value_offset() {
        let rsp = ReadRsp::new_read(&[1, 2, 3]);

        assert_eq!(&[0x0B, 1, 2, 3], rsp.raw.frame().as_ref());
        assert_eq!(&[1, 2, 3], rsp.value());

        let blob = ReadRsp::new_blob(&[]);

        assert_eq!(&[0x0D], blob.raw.frame().as_ref());
        assert_eq!(0, blob.value().len());
    }

    #[test]
    fn max_value_in_one_pdu() {
        // 512 byte attribute value plus the opcode fills the 513 byte MTU
        let value = [0x5Au8; 512];
        let rsp = ReadRsp::new_read(&value);

        assert_eq!(513, rsp.raw.pdu_size());

        match parse(rsp.raw.frame().as_ref()) {
            AttPdu::ReadRsp(r) => assert_eq!(&value[..], r.value()),
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn find_by_type_value_req_round_trip() {
        let req = FindByTypeValueReq::new(0x0001, 0xFFFF, 0x2800, &0x1800u16.to_le_bytes());

        match parse(req.raw.frame().as_ref()) {
            AttPdu::FindByTypeValueReq(r) => {
                assert_eq!(0x0001, r.start_handle());
                assert_eq!(0xFFFF, r.end_handle());
                assert_eq!(Uuid::from_u16(0x2800), r.attr_type());
                assert_eq!(&0x1800u16.to_le_bytes(), r.value());
            }
            other => panic!("wrong variant {}", other),
        }
    }

    #[test]
    fn find_by_type_value_rsp_list() {
        let mut rsp = FindByTypeValueRsp::alloc(1 + 2 * 4).unwrap();

        rsp.set_element(0, 0x0001, 0x0005).unwrap();
        rsp.set_element(1, 0x0010, 0x0014).unwrap();
        rsp.set_element_count(2).unwrap();

        match parse(rsp.raw.frame().as_ref()) {
            AttPdu::FindByTypeValueRsp(r) => {
                assert_eq!(2, r.element_count());
                assert_eq!(0x0001, r.found_handle(0).unwrap());
                assert_eq!(0x0014, r.group_end_handle(1).unwrap());
            }
            other => panic!("wrong variant {}", other),
        }
    }
}
