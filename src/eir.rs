//! EIR and advertising data
//!
//! Decoding of the TLV blocks carried in advertising reports, scan
//! responses, and Extended Inquiry Response payloads, plus the reverse
//! serialization. The element grammar is `{len:u8, type:u8, data[len-1]}`;
//! a zero length terminates the block, a length running past the buffer
//! aborts with whatever was parsed so far.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{BluetoothDeviceAddress, Uuid};

/// GAP assigned data type codes
pub mod gap {
    pub const FLAGS: u8 = 0x01;
    pub const UUID16_INCOMPLETE: u8 = 0x02;
    pub const UUID16_COMPLETE: u8 = 0x03;
    pub const UUID32_INCOMPLETE: u8 = 0x04;
    pub const UUID32_COMPLETE: u8 = 0x05;
    pub const UUID128_INCOMPLETE: u8 = 0x06;
    pub const UUID128_COMPLETE: u8 = 0x07;
    pub const NAME_LOCAL_SHORT: u8 = 0x08;
    pub const NAME_LOCAL_COMPLETE: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SSP_CLASS_OF_DEVICE: u8 = 0x0D;
    pub const SSP_HASH_C192: u8 = 0x0E;
    pub const SSP_RANDOMIZER_R192: u8 = 0x0F;
    pub const DEVICE_ID: u8 = 0x10;
    pub const SLAVE_CONN_IVAL_RANGE: u8 = 0x12;
    pub const GAP_APPEARANCE: u8 = 0x19;
    pub const MANUFACTURE_SPECIFIC: u8 = 0xFF;
}

bitflags::bitflags! {
    /// Which fields of an [`EirReport`] are populated
    pub struct EirDataMask: u32 {
        const EVT_TYPE      = 1 << 0;
        const EXT_EVT_TYPE  = 1 << 1;
        const BDADDR_TYPE   = 1 << 2;
        const BDADDR        = 1 << 3;
        const FLAGS         = 1 << 4;
        const NAME          = 1 << 5;
        const NAME_SHORT    = 1 << 6;
        const RSSI          = 1 << 7;
        const TX_POWER      = 1 << 8;
        const MANUF_DATA    = 1 << 9;
        const DEVICE_CLASS  = 1 << 10;
        const APPEARANCE    = 1 << 11;
        const HASH          = 1 << 12;
        const RANDOMIZER    = 1 << 13;
        const DEVICE_ID     = 1 << 14;
        const CONN_IVAL     = 1 << 15;
        const SERVICE_UUID  = 1 << 16;
    }
}

/// The device id quadruple of the DEVICE_ID data type
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct DeviceId {
    pub source: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

/// One decoded advertising / EIR record
///
/// Every field is guarded by its [`EirDataMask`] bit; accessors return
/// `None` until the field was seen.
#[derive(Clone,Debug,PartialEq)]
pub struct EirReport {
    mask: EirDataMask,
    event_type: u8,
    ext_event_type: u16,
    address_type: u8,
    address: BluetoothDeviceAddress,
    flags: u8,
    name: String,
    short_name: String,
    rssi: i8,
    tx_power: i8,
    manufacturer_id: u16,
    manufacturer_data: Vec<u8>,
    device_class: u32,
    appearance: u16,
    hash: [u8; 16],
    randomizer: [u8; 16],
    device_id: DeviceId,
    conn_interval_min: u16,
    conn_interval_max: u16,
    services: Vec<Uuid>,
    services_complete: bool,
}

impl Default for EirReport {
    fn default() -> Self {
        EirReport {
            mask: EirDataMask::empty(),
            event_type: 0,
            ext_event_type: 0,
            address_type: 0,
            address: [0; 6],
            flags: 0,
            name: String::new(),
            short_name: String::new(),
            rssi: 0,
            tx_power: 0,
            manufacturer_id: 0,
            manufacturer_data: Vec::new(),
            device_class: 0,
            appearance: 0,
            hash: [0; 16],
            randomizer: [0; 16],
            device_id: DeviceId::default(),
            conn_interval_min: 0,
            conn_interval_max: 0,
            services: Vec::new(),
            services_complete: false,
        }
    }
}

impl EirReport {
    pub fn new() -> Self {
        EirReport::default()
    }

    pub fn mask(&self) -> EirDataMask { self.mask }

    pub fn set_event_type(&mut self, v: u8) {
        self.event_type = v;
        self.mask |= EirDataMask::EVT_TYPE;
    }

    pub fn event_type(&self) -> Option<u8> {
        if self.mask.contains(EirDataMask::EVT_TYPE) { Some(self.event_type) } else { None }
    }

    pub fn set_ext_event_type(&mut self, v: u16) {
        self.ext_event_type = v;
        self.mask |= EirDataMask::EXT_EVT_TYPE;
    }

    pub fn ext_event_type(&self) -> Option<u16> {
        if self.mask.contains(EirDataMask::EXT_EVT_TYPE) { Some(self.ext_event_type) } else { None }
    }

    pub fn set_address(&mut self, address: BluetoothDeviceAddress, address_type: u8) {
        self.address = address;
        self.address_type = address_type;
        self.mask |= EirDataMask::BDADDR | EirDataMask::BDADDR_TYPE;
    }

    pub fn address(&self) -> Option<(&BluetoothDeviceAddress, u8)> {
        if self.mask.contains(EirDataMask::BDADDR) { Some((&self.address, self.address_type)) } else { None }
    }

    pub fn set_flags(&mut self, v: u8) {
        self.flags = v;
        self.mask |= EirDataMask::FLAGS;
    }

    pub fn flags(&self) -> Option<u8> {
        if self.mask.contains(EirDataMask::FLAGS) { Some(self.flags) } else { None }
    }

    pub fn set_name(&mut self, v: &str) {
        self.name = v.into();
        self.mask |= EirDataMask::NAME;
    }

    pub fn name(&self) -> Option<&str> {
        if self.mask.contains(EirDataMask::NAME) { Some(self.name.as_str()) } else { None }
    }

    pub fn set_short_name(&mut self, v: &str) {
        self.short_name = v.into();
        self.mask |= EirDataMask::NAME_SHORT;
    }

    pub fn short_name(&self) -> Option<&str> {
        if self.mask.contains(EirDataMask::NAME_SHORT) { Some(self.short_name.as_str()) } else { None }
    }

    pub fn set_rssi(&mut self, v: i8) {
        self.rssi = v;
        self.mask |= EirDataMask::RSSI;
    }

    pub fn rssi(&self) -> Option<i8> {
        if self.mask.contains(EirDataMask::RSSI) { Some(self.rssi) } else { None }
    }

    pub fn set_tx_power(&mut self, v: i8) {
        self.tx_power = v;
        self.mask |= EirDataMask::TX_POWER;
    }

    pub fn tx_power(&self) -> Option<i8> {
        if self.mask.contains(EirDataMask::TX_POWER) { Some(self.tx_power) } else { None }
    }

    pub fn set_manufacturer_data(&mut self, id: u16, data: &[u8]) {
        self.manufacturer_id = id;
        self.manufacturer_data = data.to_vec();
        self.mask |= EirDataMask::MANUF_DATA;
    }

    pub fn manufacturer_data(&self) -> Option<(u16, &[u8])> {
        if self.mask.contains(EirDataMask::MANUF_DATA) { Some((self.manufacturer_id, self.manufacturer_data.as_slice())) } else { None }
    }

    pub fn set_device_class(&mut self, v: u32) {
        self.device_class = v;
        self.mask |= EirDataMask::DEVICE_CLASS;
    }

    pub fn device_class(&self) -> Option<u32> {
        if self.mask.contains(EirDataMask::DEVICE_CLASS) { Some(self.device_class) } else { None }
    }

    pub fn set_appearance(&mut self, v: u16) {
        self.appearance = v;
        self.mask |= EirDataMask::APPEARANCE;
    }

    pub fn appearance(&self) -> Option<u16> {
        if self.mask.contains(EirDataMask::APPEARANCE) { Some(self.appearance) } else { None }
    }

    pub fn set_hash(&mut self, v: [u8; 16]) {
        self.hash = v;
        self.mask |= EirDataMask::HASH;
    }

    pub fn hash(&self) -> Option<&[u8; 16]> {
        if self.mask.contains(EirDataMask::HASH) { Some(&self.hash) } else { None }
    }

    pub fn set_randomizer(&mut self, v: [u8; 16]) {
        self.randomizer = v;
        self.mask |= EirDataMask::RANDOMIZER;
    }

    pub fn randomizer(&self) -> Option<&[u8; 16]> {
        if self.mask.contains(EirDataMask::RANDOMIZER) { Some(&self.randomizer) } else { None }
    }

    pub fn set_device_id(&mut self, v: DeviceId) {
        self.device_id = v;
        self.mask |= EirDataMask::DEVICE_ID;
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        if self.mask.contains(EirDataMask::DEVICE_ID) { Some(self.device_id) } else { None }
    }

    pub fn set_conn_interval_range(&mut self, min: u16, max: u16) {
        self.conn_interval_min = min;
        self.conn_interval_max = max;
        self.mask |= EirDataMask::CONN_IVAL;
    }

    pub fn conn_interval_range(&self) -> Option<(u16, u16)> {
        if self.mask.contains(EirDataMask::CONN_IVAL) { Some((self.conn_interval_min, self.conn_interval_max)) } else { None }
    }

    pub fn add_service(&mut self, uuid: Uuid, complete: bool) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
        self.services_complete = complete;
        self.mask |= EirDataMask::SERVICE_UUID;
    }

    pub fn services(&self) -> Option<(&[Uuid], bool)> {
        if self.mask.contains(EirDataMask::SERVICE_UUID) { Some((self.services.as_slice(), self.services_complete)) } else { None }
    }

    /// Decode one TLV block
    ///
    /// A zero length element terminates; a length beyond the buffer aborts
    /// keeping the fields parsed so far.
    pub fn parse_data(data: &[u8]) -> EirReport {
        let mut report = EirReport::new();
        report.read_data(data);
        report
    }

    /// Decode one TLV block into this report
    pub fn read_data(&mut self, data: &[u8]) {
        let mut at = 0usize;

        while at < data.len() {
            let len = data[at] as usize;

            if len == 0 {
                break;
            }
            if at + 1 + len > data.len() {
                log::debug!("EIR element length {} at {} exceeds block of {} bytes",
                    len, at, data.len());
                break;
            }

            let elem_type = data[at + 1];
            let payload = &data[at + 2..at + 1 + len];

            self.read_element(elem_type, payload);
            at += 1 + len;
        }
    }

    fn read_element(&mut self, elem_type: u8, payload: &[u8]) {
        match elem_type {
            gap::FLAGS => {
                if let Some(&flags) = payload.get(0) {
                    self.set_flags(flags);
                }
            }
            gap::UUID16_INCOMPLETE | gap::UUID16_COMPLETE => {
                let complete = elem_type == gap::UUID16_COMPLETE;
                for chunk in payload.chunks_exact(2) {
                    self.add_service(
                        Uuid::from_u16(<u16>::from_le_bytes([chunk[0], chunk[1]])),
                        complete,
                    );
                }
            }
            gap::UUID32_INCOMPLETE | gap::UUID32_COMPLETE => {
                let complete = elem_type == gap::UUID32_COMPLETE;
                for chunk in payload.chunks_exact(4) {
                    self.add_service(
                        Uuid::from_u32(<u32>::from_le_bytes([
                            chunk[0], chunk[1], chunk[2], chunk[3],
                        ])),
                        complete,
                    );
                }
            }
            gap::UUID128_INCOMPLETE | gap::UUID128_COMPLETE => {
                let complete = elem_type == gap::UUID128_COMPLETE;
                for chunk in payload.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    self.add_service(Uuid::from_u128(<u128>::from_le_bytes(bytes)), complete);
                }
            }
            gap::NAME_LOCAL_SHORT => {
                self.set_short_name(&String::from_utf8_lossy(payload));
            }
            gap::NAME_LOCAL_COMPLETE => {
                self.set_name(&String::from_utf8_lossy(payload));
            }
            gap::TX_POWER_LEVEL => {
                if let Some(&power) = payload.get(0) {
                    self.set_tx_power(power as i8);
                }
            }
            gap::SSP_CLASS_OF_DEVICE => {
                if payload.len() >= 3 {
                    self.set_device_class(
                        payload[0] as u32
                            | (payload[1] as u32) << 8
                            | (payload[2] as u32) << 16,
                    );
                }
            }
            gap::SSP_HASH_C192 => {
                if payload.len() >= 16 {
                    let mut hash = [0u8; 16];
                    hash.copy_from_slice(&payload[..16]);
                    self.set_hash(hash);
                }
            }
            gap::SSP_RANDOMIZER_R192 => {
                if payload.len() >= 16 {
                    let mut randomizer = [0u8; 16];
                    randomizer.copy_from_slice(&payload[..16]);
                    self.set_randomizer(randomizer);
                }
            }
            gap::DEVICE_ID => {
                if payload.len() >= 8 {
                    self.set_device_id(DeviceId {
                        source: <u16>::from_le_bytes([payload[0], payload[1]]),
                        vendor: <u16>::from_le_bytes([payload[2], payload[3]]),
                        product: <u16>::from_le_bytes([payload[4], payload[5]]),
                        version: <u16>::from_le_bytes([payload[6], payload[7]]),
                    });
                }
            }
            gap::SLAVE_CONN_IVAL_RANGE => {
                if payload.len() >= 4 {
                    self.set_conn_interval_range(
                        <u16>::from_le_bytes([payload[0], payload[1]]),
                        <u16>::from_le_bytes([payload[2], payload[3]]),
                    );
                }
            }
            gap::GAP_APPEARANCE => {
                if payload.len() >= 2 {
                    self.set_appearance(<u16>::from_le_bytes([payload[0], payload[1]]));
                }
            }
            gap::MANUFACTURE_SPECIFIC => {
                if payload.len() >= 2 {
                    self.set_manufacturer_data(
                        <u16>::from_le_bytes([payload[0], payload[1]]),
                        &payload[2..],
                    );
                }
            }
            other => {
                log::debug!("ignoring EIR element type {:#04x} of {} bytes",
                    other, payload.len());
            }
        }
    }

    /// Serialize the masked subset of fields back into a TLV block
    ///
    /// Fields that would overflow `out` are dropped with a debug warning.
    /// Returns how many bytes were written.
    pub fn write_data(&self, mask: EirDataMask, out: &mut [u8]) -> usize {
        let selected = mask & self.mask;
        let mut at = 0usize;

        let mut put = |elem_type: u8, payload: &[u8], out: &mut [u8], at: &mut usize| {
            let need = 2 + payload.len();

            if *at + need > out.len() || payload.len() + 1 > u8::max_value() as usize {
                log::debug!("dropping EIR element {:#04x}, {} bytes do not fit", elem_type, need);
                return;
            }

            out[*at] = (payload.len() + 1) as u8;
            out[*at + 1] = elem_type;
            out[*at + 2..*at + 2 + payload.len()].copy_from_slice(payload);
            *at += need;
        };

        if selected.contains(EirDataMask::FLAGS) {
            put(gap::FLAGS, &[self.flags], out, &mut at);
        }
        if selected.contains(EirDataMask::SERVICE_UUID) {
            let uuid16: Vec<u8> = self.services.iter()
                .filter(|u| u.is_16_bit())
                .flat_map(|u| {
                    use core::convert::TryFrom;
                    <u16>::try_from(*u).unwrap().to_le_bytes().to_vec()
                })
                .collect();
            let uuid128: Vec<u8> = self.services.iter()
                .filter(|u| !u.is_16_bit())
                .flat_map(|u| u.as_u128().to_le_bytes().to_vec())
                .collect();

            if !uuid16.is_empty() {
                let elem_type = if self.services_complete {
                    gap::UUID16_COMPLETE
                } else {
                    gap::UUID16_INCOMPLETE
                };
                put(elem_type, &uuid16, out, &mut at);
            }
            if !uuid128.is_empty() {
                let elem_type = if self.services_complete {
                    gap::UUID128_COMPLETE
                } else {
                    gap::UUID128_INCOMPLETE
                };
                put(elem_type, &uuid128, out, &mut at);
            }
        }
        if selected.contains(EirDataMask::NAME) {
            put(gap::NAME_LOCAL_COMPLETE, self.name.as_bytes(), out, &mut at);
        }
        if selected.contains(EirDataMask::NAME_SHORT) {
            put(gap::NAME_LOCAL_SHORT, self.short_name.as_bytes(), out, &mut at);
        }
        if selected.contains(EirDataMask::TX_POWER) {
            put(gap::TX_POWER_LEVEL, &[self.tx_power as u8], out, &mut at);
        }
        if selected.contains(EirDataMask::DEVICE_CLASS) {
            put(
                gap::SSP_CLASS_OF_DEVICE,
                &[
                    self.device_class as u8,
                    (self.device_class >> 8) as u8,
                    (self.device_class >> 16) as u8,
                ],
                out,
                &mut at,
            );
        }
        if selected.contains(EirDataMask::APPEARANCE) {
            put(gap::GAP_APPEARANCE, &self.appearance.to_le_bytes(), out, &mut at);
        }
        if selected.contains(EirDataMask::HASH) {
            put(gap::SSP_HASH_C192, &self.hash, out, &mut at);
        }
        if selected.contains(EirDataMask::RANDOMIZER) {
            put(gap::SSP_RANDOMIZER_R192, &self.randomizer, out, &mut at);
        }
        if selected.contains(EirDataMask::DEVICE_ID) {
            let mut payload = [0u8; 8];
            payload[0..2].copy_from_slice(&self.device_id.source.to_le_bytes());
            payload[2..4].copy_from_slice(&self.device_id.vendor.to_le_bytes());
            payload[4..6].copy_from_slice(&self.device_id.product.to_le_bytes());
            payload[6..8].copy_from_slice(&self.device_id.version.to_le_bytes());
            put(gap::DEVICE_ID, &payload, out, &mut at);
        }
        if selected.contains(EirDataMask::CONN_IVAL) {
            let mut payload = [0u8; 4];
            payload[0..2].copy_from_slice(&self.conn_interval_min.to_le_bytes());
            payload[2..4].copy_from_slice(&self.conn_interval_max.to_le_bytes());
            put(gap::SLAVE_CONN_IVAL_RANGE, &payload, out, &mut at);
        }
        if selected.contains(EirDataMask::MANUF_DATA) {
            let mut payload = self.manufacturer_id.to_le_bytes().to_vec();
            payload.extend_from_slice(&self.manufacturer_data);
            put(gap::MANUFACTURE_SPECIFIC, &payload, out, &mut at);
        }

        at
    }
}

/// Parse the payload of an HCI LE Advertising Report event
///
/// Reports follow each other as `{event_type, address_type, address[6],
/// data_len, data[], rssi}`; malformed tails abort with the reports parsed
/// so far.
pub fn read_ad_reports(data: &[u8]) -> Vec<EirReport> {
    let mut reports = Vec::new();

    let num = match data.get(0) {
        Some(&n) => n as usize,
        None => return reports,
    };

    let mut at = 1usize;

    for _ in 0..num {
        if at + 9 > data.len() {
            log::debug!("truncated advertising report at {}", at);
            break;
        }

        let mut report = EirReport::new();

        report.set_event_type(data[at]);

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[at + 2..at + 8]);
        report.set_address(address, data[at + 1]);

        let data_len = data[at + 8] as usize;
        if at + 9 + data_len + 1 > data.len() {
            log::debug!("truncated advertising data at {}", at);
            break;
        }

        report.read_data(&data[at + 9..at + 9 + data_len]);
        report.set_rssi(data[at + 9 + data_len] as i8);

        reports.push(report);
        at += 9 + data_len + 1;
    }

    reports
}

/// Parse the payload of an HCI LE Extended Advertising Report event
pub fn read_ext_ad_reports(data: &[u8]) -> Vec<EirReport> {
    let mut reports = Vec::new();

    let num = match data.get(0) {
        Some(&n) => n as usize,
        None => return reports,
    };

    let mut at = 1usize;

    // {evt_type:u16, addr_type, addr[6], pri_phy, sec_phy, sid, tx_power,
    //  rssi, periodic_ival:u16, direct_addr_type, direct_addr[6], len, data}
    const FIXED: usize = 2 + 1 + 6 + 1 + 1 + 1 + 1 + 1 + 2 + 1 + 6 + 1;

    for _ in 0..num {
        if at + FIXED > data.len() {
            log::debug!("truncated extended advertising report at {}", at);
            break;
        }

        let mut report = EirReport::new();

        let ext_type = <u16>::from_le_bytes([data[at], data[at + 1]]);
        report.set_ext_event_type(ext_type);
        // Legacy bits of the extended event type
        report.set_event_type((ext_type & 0x1F) as u8);

        let mut address = [0u8; 6];
        address.copy_from_slice(&data[at + 3..at + 9]);
        report.set_address(address, data[at + 2]);

        let tx_power = data[at + 12] as i8;
        if tx_power != 127 {
            report.set_tx_power(tx_power);
        }

        let rssi = data[at + 13] as i8;
        if rssi != 127 {
            report.set_rssi(rssi);
        }

        let data_len = data[at + FIXED - 1] as usize;
        if at + FIXED + data_len > data.len() {
            log::debug!("truncated extended advertising data at {}", at);
            break;
        }

        report.read_data(&data[at + FIXED..at + FIXED + data_len]);

        reports.push(report);
        at += FIXED + data_len;
    }

    reports
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_typical_ad_block() {
        // flags, complete name, one 16 bit service, tx power
        let block = [
            0x02, gap::FLAGS, 0x06,
            0x05, gap::NAME_LOCAL_COMPLETE, b'n', b'o', b'd', b'e',
            0x03, gap::UUID16_COMPLETE, 0x0F, 0x18,
            0x02, gap::TX_POWER_LEVEL, 0xF4,
        ];

        let report = EirReport::parse_data(&block);

        assert_eq!(Some(0x06), report.flags());
        assert_eq!(Some("node"), report.name());
        assert_eq!(Some(-12), report.tx_power());

        let (services, complete) = report.services().unwrap();
        assert!(complete);
        assert_eq!(&[Uuid::from_u16(0x180F)], services);
        assert_eq!(None, report.short_name());
    }

    #[test]
    fn zero_length_terminates() {
        let block = [
            0x02, gap::FLAGS, 0x05,
            0x00, // terminator
            0x05, gap::NAME_LOCAL_COMPLETE, b'x', b'x', b'x', b'x',
        ];

        let report = EirReport::parse_data(&block);

        assert_eq!(Some(0x05), report.flags());
        assert_eq!(None, report.name());
    }

    #[test]
    fn overlong_element_aborts_with_partial() {
        let block = [
            0x02, gap::FLAGS, 0x05,
            0x30, gap::NAME_LOCAL_COMPLETE, b'y', // claims 0x30 bytes
        ];

        let report = EirReport::parse_data(&block);

        assert_eq!(Some(0x05), report.flags());
        assert_eq!(None, report.name());
    }

    #[test]
    fn write_then_parse_round_trip() {
        let mut report = EirReport::new();

        report.set_flags(0x06);
        report.set_name("sensor");
        report.set_tx_power(-8);
        report.set_appearance(0x03C0);
        report.add_service(Uuid::from_u16(0x1809), true);
        report.set_manufacturer_data(0x004C, &[0x10, 0x20]);
        // rssi is not TLV-representable, the mask filter drops it
        report.set_rssi(-60);

        let mask = EirDataMask::FLAGS
            | EirDataMask::NAME
            | EirDataMask::TX_POWER
            | EirDataMask::APPEARANCE
            | EirDataMask::SERVICE_UUID
            | EirDataMask::MANUF_DATA;

        let mut buf = [0u8; 64];
        let len = report.write_data(mask, &mut buf);

        let parsed = EirReport::parse_data(&buf[..len]);

        assert_eq!(Some(0x06), parsed.flags());
        assert_eq!(Some("sensor"), parsed.name());
        assert_eq!(Some(-8), parsed.tx_power());
        assert_eq!(Some(0x03C0), parsed.appearance());
        assert_eq!(Some((0x004C, &[0x10u8, 0x20][..])), parsed.manufacturer_data());

        let (services, complete) = parsed.services().unwrap();
        assert_eq!(&[Uuid::from_u16(0x1809)], services);
        assert!(complete);
        assert_eq!(None, parsed.rssi());
    }

    #[test]
    fn write_drops_overflowing_fields() {
        let mut report = EirReport::new();

        report.set_flags(0x06);
        report.set_name("a rather long device name");

        let mut buf = [0u8; 8]; // fits flags, not the name
        let len = report.write_data(EirDataMask::FLAGS | EirDataMask::NAME, &mut buf);

        let parsed = EirReport::parse_data(&buf[..len]);

        assert_eq!(Some(0x06), parsed.flags());
        assert_eq!(None, parsed.name());
    }

    #[test]
    fn ad_report_array() {
        let mut payload = alloc::vec![2u8]; // two reports

        // report 1: ADV_IND, public, short data
        payload.push(0x00);
        payload.push(0x00);
        payload.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        payload.push(3);
        payload.extend_from_slice(&[0x02, gap::FLAGS, 0x06]);
        payload.push(0xC4); // rssi -60

        // report 2: SCAN_RSP, random, name
        payload.push(0x04);
        payload.push(0x01);
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        payload.push(4);
        payload.extend_from_slice(&[0x03, gap::NAME_LOCAL_SHORT, b'h', b'i']);
        payload.push(0xCE); // rssi -50

        let reports = read_ad_reports(&payload);

        assert_eq!(2, reports.len());
        assert_eq!(Some(0x00), reports[0].event_type());
        assert_eq!(Some(0x06), reports[0].flags());
        assert_eq!(Some(-60), reports[0].rssi());
        assert_eq!(
            Some((&[0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66], 0x00)),
            reports[0].address().map(|(a, t)| (a, t))
        );
        assert_eq!(Some("hi"), reports[1].short_name());
        assert_eq!(Some(-50), reports[1].rssi());
    }

    #[test]
    fn ext_ad_report() {
        let mut payload = alloc::vec![1u8];

        payload.extend_from_slice(&0x0013u16.to_le_bytes()); // connectable legacy
        payload.push(0x01); // random address
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        payload.push(0x01); // primary phy
        payload.push(0x00); // secondary phy
        payload.push(0x00); // sid
        payload.push(127); // tx power unavailable
        payload.push(0xC4u8); // rssi -60
        payload.extend_from_slice(&0u16.to_le_bytes()); // periodic interval
        payload.push(0x00); // direct addr type
        payload.extend_from_slice(&[0u8; 6]);
        payload.push(3); // data len
        payload.extend_from_slice(&[0x02, gap::FLAGS, 0x06]);

        let reports = read_ext_ad_reports(&payload);

        assert_eq!(1, reports.len());
        assert_eq!(Some(0x0013), reports[0].ext_event_type());
        assert_eq!(Some(0x13), reports[0].event_type());
        assert_eq!(None, reports[0].tx_power());
        assert_eq!(Some(-60), reports[0].rssi());
        assert_eq!(Some(0x06), reports[0].flags());
    }
}
