//! Owned, length-checked little-endian byte buffers
//!
//! Every PDU of this stack owns an [`Octets`] as its backing storage. All
//! multi-byte integers are little-endian, and UUIDs are serialized least
//! significant byte first, matching the Bluetooth wire formats.

use alloc::vec::Vec;
use crate::Uuid;

/// Buffer access errors
///
/// Accessors return these instead of panicking, the protocol layers convert
/// them into their own parse error kinds.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Error {
    /// `offset + width` exceeded the live size of the buffer
    OutOfRange { offset: usize, width: usize, size: usize },
    /// A resize was requested beyond the fixed capacity
    CapacityExceeded { requested: usize, capacity: usize },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            Error::OutOfRange { offset, width, size } =>
                write!(f, "index out of range: offset {} width {} size {}", offset, width, size),
            Error::CapacityExceeded { requested, capacity } =>
                write!(f, "resize to {} exceeds capacity {}", requested, capacity),
        }
    }
}

/// An owned byte buffer with a fixed capacity and an adjustable live size
///
/// The live size starts at the construction length and can be moved up to the
/// capacity or down to zero with [`resize`](Octets::resize). Accessors verify
/// `offset + width <= size` and never read the dead tail.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Octets {
    store: Vec<u8>,
    size: usize,
}

impl Octets {
    /// A zero-filled buffer with `capacity` bytes, all live
    pub fn zeroed(capacity: usize) -> Self {
        Octets { store: alloc::vec![0u8; capacity], size: capacity }
    }

    /// Copy construction, capacity and size equal the source length
    pub fn from_slice(src: &[u8]) -> Self {
        Octets { store: src.to_vec(), size: src.len() }
    }

    pub fn size(&self) -> usize { self.size }

    pub fn capacity(&self) -> usize { self.store.len() }

    /// Change the live size, only within the capacity
    pub fn resize(&mut self, new_size: usize) -> Result<(), Error> {
        if new_size <= self.store.len() {
            self.size = new_size;
            Ok(())
        } else {
            Err(Error::CapacityExceeded { requested: new_size, capacity: self.store.len() })
        }
    }

    fn check(&self, offset: usize, width: usize) -> Result<(), Error> {
        if offset.checked_add(width).map(|end| end <= self.size).unwrap_or(false) {
            Ok(())
        } else {
            Err(Error::OutOfRange { offset, width, size: self.size })
        }
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8, Error> {
        self.check(offset, 1)?;
        Ok(self.store[offset])
    }

    pub fn get_u16(&self, offset: usize) -> Result<u16, Error> {
        self.check(offset, 2)?;
        Ok(<u16>::from_le_bytes([self.store[offset], self.store[offset + 1]]))
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32, Error> {
        self.check(offset, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.store[offset..offset + 4]);
        Ok(<u32>::from_le_bytes(bytes))
    }

    pub fn get_u128(&self, offset: usize) -> Result<u128, Error> {
        self.check(offset, 16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.store[offset..offset + 16]);
        Ok(<u128>::from_le_bytes(bytes))
    }

    /// Read a 16 bit shorthand UUID
    pub fn get_uuid16(&self, offset: usize) -> Result<Uuid, Error> {
        Ok(Uuid::from_u16(self.get_u16(offset)?))
    }

    /// Read a full 128 bit UUID, stored least significant byte first
    pub fn get_uuid128(&self, offset: usize) -> Result<Uuid, Error> {
        Ok(Uuid::from_u128(self.get_u128(offset)?))
    }

    /// Zero-copy view of `width` bytes at `offset`
    pub fn get_slice(&self, offset: usize, width: usize) -> Result<&[u8], Error> {
        self.check(offset, width)?;
        Ok(&self.store[offset..offset + width])
    }

    pub fn put_u8(&mut self, offset: usize, val: u8) -> Result<(), Error> {
        self.check(offset, 1)?;
        self.store[offset] = val;
        Ok(())
    }

    pub fn put_u16(&mut self, offset: usize, val: u16) -> Result<(), Error> {
        self.check(offset, 2)?;
        self.store[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, offset: usize, val: u32) -> Result<(), Error> {
        self.check(offset, 4)?;
        self.store[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    pub fn put_u128(&mut self, offset: usize, val: u128) -> Result<(), Error> {
        self.check(offset, 16)?;
        self.store[offset..offset + 16].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// Write a UUID as its 16 bit shorthand
    ///
    /// The caller must have checked that the UUID has a short form.
    pub fn put_uuid16(&mut self, offset: usize, uuid: Uuid) -> Result<(), Error> {
        use core::convert::TryFrom;

        let v16 = <u16>::try_from(uuid)
            .unwrap_or_else(|_| (uuid.as_u128() >> 96) as u16);
        self.put_u16(offset, v16)
    }

    /// Write a UUID in its full 128 bit form, least significant byte first
    pub fn put_uuid128(&mut self, offset: usize, uuid: Uuid) -> Result<(), Error> {
        self.put_u128(offset, uuid.as_u128())
    }

    pub fn put_slice(&mut self, offset: usize, src: &[u8]) -> Result<(), Error> {
        self.check(offset, src.len())?;
        self.store[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl AsRef<[u8]> for Octets {
    /// The live range of the buffer
    fn as_ref(&self) -> &[u8] {
        &self.store[..self.size]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn little_endian_accessors() {
        let mut o = Octets::zeroed(8);

        o.put_u16(0, 0x1234).unwrap();
        o.put_u32(2, 0xA0B0_C0D0).unwrap();

        assert_eq!(&[0x34, 0x12, 0xD0, 0xC0, 0xB0, 0xA0], o.get_slice(0, 6).unwrap());
        assert_eq!(0x1234, o.get_u16(0).unwrap());
        assert_eq!(0xA0B0_C0D0, o.get_u32(2).unwrap());
    }

    #[test]
    fn bounds_are_checked() {
        let o = Octets::from_slice(&[1, 2, 3]);

        assert_eq!(Ok(3), o.get_u8(2));
        assert_eq!(
            Err(Error::OutOfRange { offset: 2, width: 2, size: 3 }),
            o.get_u16(2)
        );
        assert_eq!(
            Err(Error::OutOfRange { offset: usize::max_value(), width: 1, size: 3 }),
            o.get_u8(usize::max_value())
        );
    }

    #[test]
    fn resize_within_capacity_only() {
        let mut o = Octets::zeroed(10);

        assert_eq!(Ok(()), o.resize(4));
        assert_eq!(4, o.size());
        assert_eq!(4, o.as_ref().len());
        assert!(o.get_u8(4).is_err());

        assert_eq!(Ok(()), o.resize(10));
        assert_eq!(
            Err(Error::CapacityExceeded { requested: 11, capacity: 10 }),
            o.resize(11)
        );
    }

    #[test]
    fn uuid_serialized_lsb_first() {
        let mut o = Octets::zeroed(16);

        o.put_uuid128(0, crate::Uuid::from_u16(0x2902)).unwrap();

        // Base UUID tail comes first on the wire
        assert_eq!(&[0xFB, 0x34, 0x9B, 0x5F], o.get_slice(0, 4).unwrap());
        assert_eq!(crate::Uuid::from_u16(0x2902), o.get_uuid128(0).unwrap());
    }
}
