//! The GATT handler
//!
//! One bidirectional ATT bearer multiplexed over a single L2CAP channel.
//! A dedicated reader thread drains the channel: command replies go to a
//! bounded reply ring, notifications and indications fan out to the
//! registered listeners, and in the peripheral role incoming requests are
//! answered from the local [`server`](super::server) database.
//!
//! Application calls are blocking request/reply round trips; one command
//! mutex serializes them, so reply ordering matches issue order.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::server::{AttributeRef, DbGattServer, Mode};
use super::{
    GattCharListener,
    GattCharacteristic,
    GattDescriptor,
    GattRole,
    GattService,
    Properties,
    CHARACTERISTIC_TYPE,
    CLIENT_CHAR_CONFIG_TYPE,
    PRIMARY_SERVICE_TYPE,
    SECONDARY_SERVICE_TYPE,
    USER_DESCRIPTION_TYPE,
};
use crate::att::pdu::{
    AttPdu,
    ErrorRsp,
    ExchangeMtu,
    ExecuteWriteRsp,
    FindByTypeValueRsp,
    FindInfoReq,
    FindInfoRsp,
    HandleValueCfm,
    HandleValuePdu,
    PrepareWrite,
    ReadByGroupTypeRsp,
    ReadByTypeRsp,
    ReadBlobReq,
    ReadReq,
    ReadRsp,
    TypeReq,
    WriteRsp,
};
use crate::att::{AttOpcode, ErrorCode, MAX_ATT_MTU, MIN_ATT_MTU_LE};
use crate::buffer::Octets;
use crate::config::GattEnv;
use crate::l2cap::L2capChannel;
use crate::ring::{self, RingBuffer};
use crate::sock;
use crate::Uuid;

/// Chunks a single connection may queue through Prepare Write
const PREPARE_QUEUE_CAPACITY: usize = 32;

/// How long the reader blocks per poll; close wakes it earlier
const READER_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// GATT handler errors
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum GattError {
    /// The bearer is not connected
    NotConnected,
    /// `init_client_gatt` already completed on this handler
    AlreadyInitialized,
    /// A request got no (matching) reply within its deadline
    Timeout,
    /// The bearer failed; the handler disconnected itself
    IoError,
    /// A PDU or value does not fit the negotiated MTU
    MtuExceeded { size: usize, mtu: usize },
    /// The remote answered with an ATT error
    Att(ErrorCode),
    /// A reply failed to parse
    Codec(crate::att::Error),
    /// A matching reply carried an unexpected variant
    UnexpectedPdu(u8),
    /// A local sanity check failed, e.g. enabling notifications on a
    /// characteristic without the Notify property
    InvalidParameter(&'static str),
    /// No attribute with the given handle or UUID is known
    UnknownAttribute,
}

impl core::fmt::Display for GattError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            GattError::NotConnected => write!(f, "not connected"),
            GattError::AlreadyInitialized => write!(f, "already initialized"),
            GattError::Timeout => write!(f, "timeout"),
            GattError::IoError => write!(f, "io error"),
            GattError::MtuExceeded { size, mtu } =>
                write!(f, "pdu size {} exceeds mtu {}", size, mtu),
            GattError::Att(code) => write!(f, "att error: {}", code),
            GattError::Codec(e) => write!(f, "{}", e),
            GattError::UnexpectedPdu(op) => write!(f, "unexpected pdu {:#04x}", op),
            GattError::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            GattError::UnknownAttribute => write!(f, "unknown attribute"),
        }
    }
}

impl From<crate::att::Error> for GattError {
    fn from(e: crate::att::Error) -> GattError {
        GattError::Codec(e)
    }
}

/// Outcome of `init_client_gatt`
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum InitStatus {
    Initialized,
    AlreadyInitialized,
}

struct PrepareChunk {
    handle: u16,
    offset: u16,
    value: Vec<u8>,
}

#[derive(Default)]
struct PrepareQueue {
    chunks: Vec<PrepareChunk>,
    /// Originating handles, in queueing order
    handles: Vec<u16>,
}

impl PrepareQueue {
    fn clear(&mut self) {
        self.chunks.clear();
        self.handles.clear();
    }

    /// The offset the next chunk for `handle` must start at
    fn expected_offset(&self, handle: u16) -> u16 {
        self.chunks.iter()
            .rev()
            .find(|c| c.handle == handle)
            .map(|c| c.offset + c.value.len() as u16)
            .unwrap_or(0)
    }
}

struct Inner<C: L2capChannel> {
    channel: C,
    role: GattRole,
    reply_ring: RingBuffer<AttPdu>,
    is_connected: AtomicBool,
    has_ioerror: AtomicBool,
    server_mtu: AtomicU16,
    used_mtu: AtomicU16,
    mtu_exchanged: AtomicBool,
    send_indication_confirmation: AtomicBool,
    services: Mutex<Vec<GattService>>,
    listeners: Mutex<Arc<Vec<Arc<dyn GattCharListener>>>>,
    server: Arc<DbGattServer>,
    prepare_queue: Mutex<PrepareQueue>,
    debug_data: bool,
}

impl<C: L2capChannel> Inner<C> {
    fn used_mtu(&self) -> usize {
        self.used_mtu.load(Ordering::SeqCst) as usize
    }

    /// Raw frame send, logging instead of propagating
    ///
    /// Used on the reader thread for replies and confirmations where the
    /// caller has nobody to report to.
    fn send_frame_logged(&self, pdu: &AttPdu) {
        if self.debug_data {
            log::debug!("GATT TX: {}", pdu);
        }

        if let Err(e) = self.channel.write(pdu.bytes()) {
            log::warn!("failed to send {}: {}", pdu, e);
        }
    }

    fn ring_put(&self, pdu: AttPdu) {
        let batch = self.reply_ring.capacity() / 4;

        match self.reply_ring.put_dropping_oldest(pdu, batch) {
            Ok(0) => (),
            Ok(dropped) => log::warn!(
                "ATT reply ring full, dropped {} oldest of {} capacity",
                dropped,
                self.reply_ring.capacity()
            ),
            Err(_) => (),
        }
    }
}

/// The ATT bearer of one device connection
///
/// Generic over the [`L2capChannel`] seam; production uses
/// [`L2capSocket`](crate::l2cap::L2capSocket), tests drive in-memory
/// channels.
pub struct GattHandler<C: L2capChannel + 'static> {
    inner: Arc<Inner<C>>,
    client_mtu: u16,
    read_cmd_timeout: Duration,
    write_cmd_timeout: Duration,
    initial_cmd_timeout: Duration,
    cmd_mtx: Mutex<()>,
    initialized: AtomicBool,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    reader_thread_id: Mutex<Option<thread::ThreadId>>,
}

impl<C: L2capChannel + 'static> GattHandler<C> {
    /// Construct a handler over an open L2CAP channel and start its reader
    ///
    /// `supervision_timeout` is the LE connection supervision timeout; the
    /// actual reply deadlines derive from it and the environment floors:
    /// reads and writes use `max(supervision_timeout + 50ms, floor)`, the
    /// initial exchange uses `min(10s, max(2 * supervision_timeout,
    /// floor))`.
    pub fn new(
        channel: C,
        role: GattRole,
        supervision_timeout: Duration,
        server: Arc<DbGattServer>,
    ) -> Arc<Self> {
        let env = GattEnv::get();

        let grace = supervision_timeout + Duration::from_millis(50);

        let inner = Arc::new(Inner {
            channel,
            role,
            reply_ring: RingBuffer::new(env.attpdu_ring_capacity),
            is_connected: AtomicBool::new(true),
            has_ioerror: AtomicBool::new(false),
            server_mtu: AtomicU16::new(MIN_ATT_MTU_LE),
            used_mtu: AtomicU16::new(MIN_ATT_MTU_LE),
            mtu_exchanged: AtomicBool::new(false),
            send_indication_confirmation: AtomicBool::new(true),
            services: Mutex::new(Vec::new()),
            listeners: Mutex::new(Arc::new(Vec::new())),
            server,
            prepare_queue: Mutex::new(PrepareQueue::default()),
            debug_data: env.debug_data,
        });

        let handler = Arc::new(GattHandler {
            inner: inner.clone(),
            client_mtu: MAX_ATT_MTU,
            read_cmd_timeout: grace.max(env.read_cmd_reply_timeout),
            write_cmd_timeout: grace.max(env.write_cmd_reply_timeout),
            initial_cmd_timeout: (supervision_timeout * 2)
                .max(env.initial_cmd_reply_timeout)
                .min(Duration::from_millis(10_000)),
            cmd_mtx: Mutex::new(()),
            initialized: AtomicBool::new(false),
            reader: Mutex::new(None),
            reader_thread_id: Mutex::new(None),
        });

        let reader_inner = inner;
        let handle = thread::spawn(move || reader_loop(reader_inner));

        *handler.reader_thread_id.lock().unwrap() = Some(handle.thread().id());
        *handler.reader.lock().unwrap() = Some(handle);

        handler
    }

    pub fn role(&self) -> GattRole {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected.load(Ordering::SeqCst)
    }

    pub fn has_io_error(&self) -> bool {
        self.inner.has_ioerror.load(Ordering::SeqCst)
    }

    /// The negotiated bearer MTU
    pub fn used_mtu(&self) -> u16 {
        self.inner.used_mtu.load(Ordering::SeqCst)
    }

    /// The MTU the server reported in the exchange
    pub fn server_mtu(&self) -> u16 {
        self.inner.server_mtu.load(Ordering::SeqCst)
    }

    pub fn mtu_exchanged(&self) -> bool {
        self.inner.mtu_exchanged.load(Ordering::SeqCst)
    }

    /// Whether indications are auto-confirmed after listener dispatch
    pub fn set_send_indication_confirmation(&self, enable: bool) {
        self.inner.send_indication_confirmation.store(enable, Ordering::SeqCst);
    }

    /// Run the discovered services under the lock
    pub fn with_services<R>(&self, f: impl FnOnce(&[GattService]) -> R) -> R {
        f(&self.inner.services.lock().unwrap())
    }

    /// Register a characteristic listener; duplicates (same `Arc`) are
    /// ignored
    pub fn add_listener(&self, listener: Arc<dyn GattCharListener>) -> bool {
        let mut guard = self.inner.listeners.lock().unwrap();

        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }

        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Remove a characteristic listener by identity
    pub fn remove_listener(&self, listener: &Arc<dyn GattCharListener>) -> bool {
        let mut guard = self.inner.listeners.lock().unwrap();

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

    /// Send a PDU without waiting for a reply
    ///
    /// Refused when the frame exceeds the negotiated MTU or the bearer is
    /// down.
    pub fn send(&self, pdu: &AttPdu) -> Result<(), GattError> {
        if !self.is_connected() {
            return Err(GattError::NotConnected);
        }

        let mtu = self.inner.used_mtu();

        if pdu.pdu_size() > mtu {
            return Err(GattError::MtuExceeded { size: pdu.pdu_size(), mtu });
        }

        if self.inner.debug_data {
            log::debug!("GATT TX: {}", pdu);
        }

        match self.inner.channel.write(pdu.bytes()) {
            Ok(_) => Ok(()),
            Err(sock::Error::NotConnected) => {
                self.disconnect(false, false);
                Err(GattError::NotConnected)
            }
            Err(e) => {
                log::warn!("GATT send failed: {}", e);
                self.disconnect(true, true);
                Err(GattError::IoError)
            }
        }
    }

    /// Send a request and block for its matching reply
    ///
    /// The reply must carry the request's response opcode or be an error
    /// response with the matching caused-opcode; anything else is dropped
    /// and the wait resumes. After ring-capacity mismatches or on deadline
    /// the call fails with [`GattError::Timeout`].
    pub fn send_with_reply(&self, pdu: &AttPdu, timeout: Duration) -> Result<AttPdu, GattError> {
        let request_opcode = pdu.opcode()
            .filter(|op| op.is_request())
            .ok_or(GattError::InvalidParameter("not a request pdu"))?;

        let _cmd_guard = self.cmd_mtx.lock().unwrap();

        self.send(pdu)?;

        let deadline = std::time::Instant::now() + timeout;
        let mut mismatches = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());

            let reply = self.inner.reply_ring.get(remaining).map_err(|e| match e {
                ring::Error::Timeout => GattError::Timeout,
                _ => {
                    if self.has_io_error() {
                        GattError::IoError
                    } else {
                        GattError::NotConnected
                    }
                }
            })?;

            if reply.answers(request_opcode) {
                return Ok(reply);
            }

            log::debug!("dropping mismatched reply {} to {}", reply, request_opcode);
            mismatches += 1;

            if mismatches >= self.inner.reply_ring.capacity() {
                return Err(GattError::Timeout);
            }
        }
    }

    /// Exchange MTU, discover services, characteristics and descriptors
    ///
    /// Idempotent; a second call reports
    /// [`InitStatus::AlreadyInitialized`] without touching the bearer. On
    /// failure the handler stays uninitialized and the call may be retried.
    pub fn init_client_gatt(&self) -> Result<InitStatus, GattError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(InitStatus::AlreadyInitialized);
        }
        if self.inner.role != GattRole::Client {
            return Err(GattError::InvalidParameter("not in client role"));
        }

        self.exchange_mtu()?;

        let mut services = self.discover_primary_services()?;

        for service in services.iter_mut() {
            self.discover_characteristics(service)?;
            self.discover_descriptors(service)?;
        }

        *self.inner.services.lock().unwrap() = services;
        self.initialized.store(true, Ordering::SeqCst);

        Ok(InitStatus::Initialized)
    }

    fn exchange_mtu(&self) -> Result<(), GattError> {
        if self.mtu_exchanged() {
            return Ok(());
        }

        let req = AttPdu::ExchangeMtuReq(ExchangeMtu::new_req(self.client_mtu));
        let reply = self.send_with_reply(&req, self.initial_cmd_timeout)?;

        // The flag is set on any protocol-level outcome so the exchange is
        // never re-attempted on this bearer.
        self.inner.mtu_exchanged.store(true, Ordering::SeqCst);

        match reply {
            AttPdu::ExchangeMtuRsp(rsp) => {
                let server_mtu = rsp.mtu();
                let used = self.client_mtu
                    .min(server_mtu)
                    .max(MIN_ATT_MTU_LE)
                    .min(MAX_ATT_MTU);

                self.inner.server_mtu.store(server_mtu, Ordering::SeqCst);
                self.inner.used_mtu.store(used, Ordering::SeqCst);

                log::debug!("MTU exchanged: client {}, server {}, used {}",
                    self.client_mtu, server_mtu, used);
                Ok(())
            }
            AttPdu::ErrorRsp(err) => {
                log::info!("server rejected MTU exchange ({}); staying at {}",
                    err.code(), MIN_ATT_MTU_LE);
                Ok(())
            }
            other => Err(GattError::UnexpectedPdu(other.opcode_raw())),
        }
    }

    fn discover_primary_services(&self) -> Result<Vec<GattService>, GattError> {
        let mut services = Vec::new();
        let mut start: u32 = 0x0001;

        while start <= 0xFFFF {
            let req = AttPdu::ReadByGroupTypeReq(TypeReq::new_read_by_group_type(
                start as u16,
                0xFFFF,
                PRIMARY_SERVICE_TYPE,
            ));

            match self.send_with_reply(&req, self.read_cmd_timeout)? {
                AttPdu::ReadByGroupTypeRsp(rsp) => {
                    let mut last_end = start as u16;

                    for i in 0..rsp.element_count() {
                        let handle = rsp.element_handle(i)?;
                        let end = rsp.element_end_handle(i)?;
                        let value = rsp.element_value(i)?;

                        let service_type = match value.len() {
                            2 => Uuid::from_u16(<u16>::from_le_bytes([value[0], value[1]])),
                            16 => {
                                let mut bytes = [0u8; 16];
                                bytes.copy_from_slice(value);
                                Uuid::from_u128(<u128>::from_le_bytes(bytes))
                            }
                            n => {
                                log::warn!("service uuid of width {} skipped", n);
                                last_end = end;
                                continue;
                            }
                        };

                        services.push(GattService {
                            start_handle: handle,
                            end_handle: end,
                            service_type,
                            primary: true,
                            characteristics: Vec::new(),
                        });

                        last_end = end;
                    }

                    if last_end == 0xFFFF {
                        break;
                    }
                    start = last_end as u32 + 1;
                }
                AttPdu::ErrorRsp(err) if err.code() == ErrorCode::AttributeNotFound => break,
                AttPdu::ErrorRsp(err) => return Err(GattError::Att(err.code())),
                other => return Err(GattError::UnexpectedPdu(other.opcode_raw())),
            }
        }

        Ok(services)
    }

    fn discover_characteristics(&self, service: &mut GattService) -> Result<(), GattError> {
        let mut start: u32 = service.start_handle as u32;

        while start <= service.end_handle as u32 {
            let req = AttPdu::ReadByTypeReq(TypeReq::new_read_by_type(
                start as u16,
                service.end_handle,
                CHARACTERISTIC_TYPE,
            ));

            match self.send_with_reply(&req, self.read_cmd_timeout)? {
                AttPdu::ReadByTypeRsp(rsp) => {
                    let mut last_handle = start as u16;

                    for i in 0..rsp.element_count() {
                        let decl_handle = rsp.element_handle(i)?;
                        let value = rsp.element_value(i)?;

                        // {properties, value_handle, uuid16|uuid128}
                        if value.len() != 5 && value.len() != 19 {
                            log::warn!("characteristic declaration of width {} skipped",
                                value.len());
                            last_handle = decl_handle;
                            continue;
                        }

                        let properties = Properties::from_bits_truncate(value[0]);
                        let value_handle = <u16>::from_le_bytes([value[1], value[2]]);
                        let char_type = if value.len() == 5 {
                            Uuid::from_u16(<u16>::from_le_bytes([value[3], value[4]]))
                        } else {
                            let mut bytes = [0u8; 16];
                            bytes.copy_from_slice(&value[3..]);
                            Uuid::from_u128(<u128>::from_le_bytes(bytes))
                        };

                        service.characteristics.push(GattCharacteristic {
                            declaration_handle: decl_handle,
                            value_handle,
                            end_handle: service.end_handle,
                            properties,
                            char_type,
                            value: Vec::new(),
                            descriptors: Vec::new(),
                            cccd_index: None,
                            user_description_index: None,
                            notify_enabled: false,
                            indicate_enabled: false,
                        });

                        last_handle = decl_handle;
                    }

                    if last_handle as u32 >= service.end_handle as u32 {
                        break;
                    }
                    start = last_handle as u32 + 1;
                }
                AttPdu::ErrorRsp(err) if err.code() == ErrorCode::AttributeNotFound => break,
                AttPdu::ErrorRsp(err) => return Err(GattError::Att(err.code())),
                other => return Err(GattError::UnexpectedPdu(other.opcode_raw())),
            }
        }

        // The end handle of a characteristic is the handle preceding the
        // next declaration, or the service end for the last one.
        let count = service.characteristics.len();
        for i in 0..count {
            service.characteristics[i].end_handle = if i + 1 < count {
                service.characteristics[i + 1].declaration_handle - 1
            } else {
                service.end_handle
            };
        }

        Ok(())
    }

    fn discover_descriptors(&self, service: &mut GattService) -> Result<(), GattError> {
        for characteristic in service.characteristics.iter_mut() {
            if characteristic.value_handle >= characteristic.end_handle {
                continue;
            }

            let mut start: u32 = characteristic.value_handle as u32 + 1;

            'chars: while start <= characteristic.end_handle as u32 {
                let req = AttPdu::FindInfoReq(FindInfoReq::new(
                    start as u16,
                    characteristic.end_handle,
                ));

                match self.send_with_reply(&req, self.read_cmd_timeout)? {
                    AttPdu::FindInfoRsp(rsp) => {
                        let mut last_handle = start as u16;

                        for i in 0..rsp.element_count() {
                            let handle = rsp.element_handle(i)?;
                            let desc_type = rsp.element_uuid(i)?;

                            if desc_type == CLIENT_CHAR_CONFIG_TYPE {
                                characteristic.cccd_index =
                                    Some(characteristic.descriptors.len());
                            } else if desc_type == USER_DESCRIPTION_TYPE {
                                characteristic.user_description_index =
                                    Some(characteristic.descriptors.len());
                            }

                            characteristic.descriptors.push(GattDescriptor {
                                handle,
                                desc_type,
                                value: Vec::new(),
                            });

                            last_handle = handle;
                        }

                        if last_handle as u32 >= characteristic.end_handle as u32 {
                            break 'chars;
                        }
                        start = last_handle as u32 + 1;
                    }
                    AttPdu::ErrorRsp(err) if err.code() == ErrorCode::AttributeNotFound => {
                        break 'chars;
                    }
                    AttPdu::ErrorRsp(err) => return Err(GattError::Att(err.code())),
                    other => return Err(GattError::UnexpectedPdu(other.opcode_raw())),
                }
            }
        }

        Ok(())
    }

    /// Read an attribute value, following up with Read Blob requests
    ///
    /// * `expected_length == 0` issues exactly one Read Request.
    /// * `expected_length < 0` keeps reading blobs while full-MTU responses
    ///   arrive, until a short response, an empty response, or the server
    ///   reports the offset is past the end.
    /// * `expected_length > 0` additionally stops once that many bytes
    ///   accumulated.
    pub fn read_value(&self, handle: u16, expected_length: i32) -> Result<Vec<u8>, GattError> {
        let full = self.inner.used_mtu() - 1;
        let mut acc: Vec<u8> = Vec::new();

        let reply = self.send_with_reply(
            &AttPdu::ReadReq(ReadReq::new(handle)),
            self.read_cmd_timeout,
        )?;

        let mut last_len = match reply {
            AttPdu::ReadRsp(rsp) => {
                acc.extend_from_slice(rsp.value());
                rsp.value().len()
            }
            AttPdu::ErrorRsp(err) => return Err(GattError::Att(err.code())),
            other => return Err(GattError::UnexpectedPdu(other.opcode_raw())),
        };

        if expected_length == 0 {
            return Ok(acc);
        }

        while last_len == full
            && (expected_length < 0 || acc.len() < expected_length as usize)
            && acc.len() <= u16::max_value() as usize
        {
            let req = AttPdu::ReadBlobReq(ReadBlobReq::new(handle, acc.len() as u16));

            match self.send_with_reply(&req, self.read_cmd_timeout)? {
                AttPdu::ReadBlobRsp(rsp) => {
                    if rsp.value().is_empty() {
                        break;
                    }
                    acc.extend_from_slice(rsp.value());
                    last_len = rsp.value().len();
                }
                AttPdu::ErrorRsp(err)
                    if err.code() == ErrorCode::InvalidOffset
                        || err.code() == ErrorCode::AttributeNotLong =>
                {
                    break;
                }
                AttPdu::ErrorRsp(err) => return Err(GattError::Att(err.code())),
                other => return Err(GattError::UnexpectedPdu(other.opcode_raw())),
            }
        }

        Ok(acc)
    }

    /// Write an attribute value and await the Write Response
    ///
    /// The value must fit a single request, `used_mtu - 3` bytes.
    pub fn write_value(&self, handle: u16, value: &[u8]) -> Result<(), GattError> {
        let mtu = self.inner.used_mtu();

        if value.len() + 3 > mtu {
            return Err(GattError::MtuExceeded { size: value.len() + 3, mtu });
        }

        let req = AttPdu::WriteReq(HandleValuePdu::new_write_req(handle, value));

        match self.send_with_reply(&req, self.write_cmd_timeout)? {
            AttPdu::WriteRsp(_) => Ok(()),
            AttPdu::ErrorRsp(err) => Err(GattError::Att(err.code())),
            other => Err(GattError::UnexpectedPdu(other.opcode_raw())),
        }
    }

    /// Write an attribute value as a command, no response
    pub fn write_value_no_resp(&self, handle: u16, value: &[u8]) -> Result<(), GattError> {
        let mtu = self.inner.used_mtu();

        if value.len() + 3 > mtu {
            return Err(GattError::MtuExceeded { size: value.len() + 3, mtu });
        }

        self.send(&AttPdu::WriteCmd(HandleValuePdu::new_write_cmd(handle, value)))
    }

    /// Configure notifications/indications through the CCCD
    ///
    /// Writes `bit 0 = notify, bit 1 = indicate` to the characteristic's
    /// CCCD. Enabling a mode the characteristic's properties do not
    /// advertise is refused locally.
    pub fn configure_notifications(
        &self,
        value_handle: u16,
        enable_notify: bool,
        enable_indicate: bool,
    ) -> Result<(), GattError> {
        let (cccd_handle, properties) = {
            let services = self.inner.services.lock().unwrap();

            let characteristic = services.iter()
                .find_map(|s| s.find_char_by_value_handle(value_handle))
                .ok_or(GattError::UnknownAttribute)?;

            let cccd = characteristic.cccd().ok_or(GattError::UnknownAttribute)?;

            (cccd.handle, characteristic.properties)
        };

        if enable_notify && !properties.contains(Properties::NOTIFY) {
            return Err(GattError::InvalidParameter("characteristic cannot notify"));
        }
        if enable_indicate && !properties.contains(Properties::INDICATE) {
            return Err(GattError::InvalidParameter("characteristic cannot indicate"));
        }

        let bits: u16 = (enable_notify as u16) | ((enable_indicate as u16) << 1);

        self.write_value(cccd_handle, &bits.to_le_bytes())?;

        let mut services = self.inner.services.lock().unwrap();
        if let Some(characteristic) = services.iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.value_handle == value_handle)
        {
            characteristic.notify_enabled = enable_notify;
            characteristic.indicate_enabled = enable_indicate;
        }

        Ok(())
    }

    /// Server role: push a notification for a characteristic value handle
    pub fn send_notification(&self, value_handle: u16) -> Result<(), GattError> {
        let value = {
            let db = self.inner.server.db();
            db.find_char_by_value_handle(value_handle)
                .ok_or(GattError::UnknownAttribute)?
                .value()
                .to_vec()
        };

        let take = value.len().min(self.inner.used_mtu() - 3);

        self.send(&AttPdu::HandleValueNtf(HandleValuePdu::new_notification(
            value_handle,
            &value[..take],
        )))
    }

    /// Server role: push an indication and await the confirmation
    pub fn send_indication(&self, value_handle: u16) -> Result<(), GattError> {
        let value = {
            let db = self.inner.server.db();
            db.find_char_by_value_handle(value_handle)
                .ok_or(GattError::UnknownAttribute)?
                .value()
                .to_vec()
        };

        let take = value.len().min(self.inner.used_mtu() - 3);
        let pdu = AttPdu::HandleValueInd(HandleValuePdu::new_indication(
            value_handle,
            &value[..take],
        ));

        let _cmd_guard = self.cmd_mtx.lock().unwrap();

        self.send(&pdu)?;

        let deadline = std::time::Instant::now() + self.write_cmd_timeout;
        let mut mismatches = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());

            let reply = self.inner.reply_ring.get(remaining).map_err(|e| match e {
                ring::Error::Timeout => GattError::Timeout,
                _ => GattError::NotConnected,
            })?;

            if let AttPdu::HandleValueCfm(_) = reply {
                return Ok(());
            }

            mismatches += 1;
            if mismatches >= self.inner.reply_ring.capacity() {
                return Err(GattError::Timeout);
            }
        }
    }

    /// Tear the bearer down
    ///
    /// Closes the channel, stops the reader, and fails all in-flight reply
    /// waiters with "disconnected". `request_device_disconnect` is a hint
    /// to the owning layer that the link itself should go; `io_error` marks
    /// the teardown as caused by a transport failure.
    pub fn disconnect(&self, request_device_disconnect: bool, io_error: bool) {
        if !self.inner.is_connected.swap(false, Ordering::SeqCst) {
            return;
        }

        if io_error {
            self.inner.has_ioerror.store(true, Ordering::SeqCst);
        }
        if request_device_disconnect {
            log::debug!("device-level disconnect requested");
        }

        self.inner.channel.close();
        self.inner.reply_ring.close();
        self.inner.server.db().reset_all_cccd();
        self.inner.prepare_queue.lock().unwrap().clear();

        let on_reader = *self.reader_thread_id.lock().unwrap() == Some(thread::current().id());

        if !on_reader {
            if let Some(handle) = self.reader.lock().unwrap().take() {
                handle.join().ok();
            }
        }
    }
}

impl<C: L2capChannel + 'static> Drop for GattHandler<C> {
    fn drop(&mut self) {
        self.disconnect(false, false);
    }
}

fn reader_loop<C: L2capChannel>(inner: Arc<Inner<C>>) {
    let mut buf = alloc::vec![0u8; MAX_ATT_MTU as usize];

    loop {
        if !inner.is_connected.load(Ordering::SeqCst) {
            break;
        }

        let n = match inner.channel.read(&mut buf, READER_POLL_TIMEOUT) {
            Ok(n) => n,
            Err(sock::Error::Timeout) | Err(sock::Error::Interrupted) => continue,
            Err(sock::Error::NotConnected) => break,
            Err(sock::Error::Io(errno)) => {
                log::warn!("ATT bearer read failed, errno {}", errno);
                inner.has_ioerror.store(true, Ordering::SeqCst);
                break;
            }
        };

        let pdu = match AttPdu::parse(Octets::from_slice(&buf[..n])) {
            Ok(pdu) => pdu,
            Err(e) => {
                log::warn!("dropping malformed ATT frame: {}", e);
                continue;
            }
        };

        if inner.debug_data {
            log::debug!("GATT RX: {}", pdu);
        }

        dispatch_received(&inner, pdu);
    }

    // Fail any in-flight waiters; the owning handler completes the
    // teardown when `disconnect` runs.
    inner.is_connected.store(false, Ordering::SeqCst);
    inner.channel.close();
    inner.reply_ring.close();
}

fn dispatch_received<C: L2capChannel>(inner: &Arc<Inner<C>>, pdu: AttPdu) {
    match pdu {
        AttPdu::HandleValueNtf(hv) => {
            fan_out_value_event(inner, &hv, false, false);
        }
        AttPdu::HandleValueInd(hv) => {
            let confirm = inner.send_indication_confirmation.load(Ordering::SeqCst);

            fan_out_value_event(inner, &hv, true, confirm);

            if confirm {
                inner.send_frame_logged(&AttPdu::HandleValueCfm(HandleValueCfm::new()));
            }
        }
        AttPdu::HandleValueCfm(cfm) => {
            // Answer to an indication this side sent
            inner.ring_put(AttPdu::HandleValueCfm(cfm));
        }
        AttPdu::Unknown(raw) => {
            if AttOpcode::is_command(raw.opcode_raw()) {
                log::warn!("dropping unknown command {:#04x}", raw.opcode_raw());
            } else {
                log::warn!("unknown request {:#04x}, replying unsupported", raw.opcode_raw());
                inner.send_frame_logged(&AttPdu::ErrorRsp(ErrorRsp::new(
                    raw.opcode_raw(),
                    0,
                    ErrorCode::RequestNotSupported,
                )));
            }
        }
        other => {
            let is_response = other.opcode().map(|op| op.is_response()).unwrap_or(false);

            if is_response {
                inner.ring_put(other);
            } else if inner.role == GattRole::Server {
                server_dispatch(inner, other);
            } else {
                // A request at the client side of the bearer
                inner.send_frame_logged(&AttPdu::ErrorRsp(ErrorRsp::new(
                    other.opcode_raw(),
                    0,
                    ErrorCode::RequestNotSupported,
                )));
            }
        }
    }
}

/// Locate the characteristic by value handle and fan the event out
fn fan_out_value_event<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    hv: &HandleValuePdu,
    indication: bool,
    confirmation_sent: bool,
) {
    let listeners = inner.listeners.lock().unwrap().clone();

    // Clones so no lock is held while the listeners run; a listener is
    // free to look the tree up again.
    let hit = {
        let services = inner.services.lock().unwrap();

        services.iter().find_map(|s| {
            s.find_char_by_value_handle(hv.handle()).map(|c| (s.clone(), c.clone()))
        })
    };

    let (service, characteristic) = match hit {
        Some(pair) => pair,
        None => {
            log::debug!("value event for unknown handle {:#06x}", hv.handle());
            return;
        }
    };

    for listener in listeners.iter() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if indication {
                listener.indication_received(
                    &service, &characteristic, hv.value(), confirmation_sent,
                );
            } else {
                listener.notification_received(&service, &characteristic, hv.value());
            }
        }));

        if result.is_err() {
            log::error!("characteristic listener panicked; continuing");
        }
    }
}

// ---- peripheral-role request processing -----------------------------------

fn server_dispatch<C: L2capChannel>(inner: &Arc<Inner<C>>, pdu: AttPdu) {
    let reply = match pdu {
        AttPdu::ExchangeMtuReq(m) => Some(server_reply_mtu(inner, &m)),
        AttPdu::ReadReq(r) => Some(server_reply_read(inner, r.handle(), 0, false)),
        AttPdu::ReadBlobReq(r) =>
            Some(server_reply_read(inner, r.handle(), r.offset() as usize, true)),
        AttPdu::WriteReq(hv) =>
            Some(server_reply_write(inner, hv.handle(), hv.value(), true)
                .unwrap_or_else(|e| e)),
        AttPdu::WriteCmd(hv) | AttPdu::SignedWriteCmd(hv) => {
            // Commands get no reply, not even errors
            if let Err(e) = server_reply_write(inner, hv.handle(), hv.value(), false) {
                log::debug!("write command rejected: {}", e);
            }
            None
        }
        AttPdu::PrepareWriteReq(p) => Some(server_reply_prepare_write(inner, &p)),
        AttPdu::ExecuteWriteReq(e) => Some(server_reply_execute_write(inner, e.execute())),
        AttPdu::ReadByGroupTypeReq(r) => Some(server_reply_read_by_group_type(inner, &r)),
        AttPdu::ReadByTypeReq(r) => Some(server_reply_read_by_type(inner, &r)),
        AttPdu::FindInfoReq(r) => Some(server_reply_find_info(inner, &r)),
        AttPdu::FindByTypeValueReq(r) => Some(server_reply_find_by_type_value(inner, &r)),
        other => {
            log::warn!("unhandled request {} at server", other);
            Some(AttPdu::ErrorRsp(ErrorRsp::new(
                other.opcode_raw(), 0, ErrorCode::RequestNotSupported,
            )))
        }
    };

    if let Some(reply) = reply {
        inner.send_frame_logged(&reply);
    }
}

fn err_rsp(caused: AttOpcode, handle: u16, code: ErrorCode) -> AttPdu {
    AttPdu::ErrorRsp(ErrorRsp::new(caused.into(), handle, code))
}

fn server_reply_mtu<C: L2capChannel>(inner: &Arc<Inner<C>>, m: &ExchangeMtu) -> AttPdu {
    let client_mtu = m.mtu();
    let used = client_mtu.min(MAX_ATT_MTU).max(MIN_ATT_MTU_LE);

    inner.server_mtu.store(client_mtu, Ordering::SeqCst);
    inner.used_mtu.store(used, Ordering::SeqCst);
    inner.mtu_exchanged.store(true, Ordering::SeqCst);

    AttPdu::ExchangeMtuRsp(ExchangeMtu::new_rsp(MAX_ATT_MTU))
}

fn server_reply_read<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    handle: u16,
    offset: usize,
    blob: bool,
) -> AttPdu {
    let caused = if blob { AttOpcode::ReadBlobReq } else { AttOpcode::ReadReq };

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, handle, ErrorCode::AttributeNotFound);
    }

    let listeners = inner.server.listeners();
    let db = inner.server.db();

    let value: Vec<u8> = match db.resolve_handle(handle) {
        Some(AttributeRef::CharValue { service, characteristic }) => {
            let s = &db.services[service];
            let c = &s.characteristics[characteristic];

            if !listeners.iter().all(|l| l.read_char_value(s, c)) {
                return err_rsp(caused, handle, ErrorCode::ReadNotPermitted);
            }
            c.value().to_vec()
        }
        Some(AttributeRef::Descriptor { service, characteristic, descriptor }) => {
            let s = &db.services[service];
            let c = &s.characteristics[characteristic];
            let d = &c.descriptors[descriptor];

            if !listeners.iter().all(|l| l.read_desc_value(s, c, d)) {
                return err_rsp(caused, handle, ErrorCode::ReadNotPermitted);
            }
            d.value().to_vec()
        }
        Some(AttributeRef::ServiceDeclaration { service }) => {
            let s = &db.services[service];
            uuid_bytes(s.service_type)
        }
        Some(AttributeRef::CharDeclaration { service, characteristic }) => {
            let c = &db.services[service].characteristics[characteristic];
            let mut v = alloc::vec![c.properties.bits()];
            v.extend_from_slice(&c.value_handle.to_le_bytes());
            v.extend_from_slice(&uuid_bytes(c.char_type));
            v
        }
        None => return err_rsp(caused, handle, ErrorCode::InvalidHandle),
    };

    if offset > value.len() {
        return err_rsp(caused, handle, ErrorCode::InvalidOffset);
    }

    let take = (value.len() - offset).min(inner.used_mtu() - 1);
    let slice = &value[offset..offset + take];

    if blob {
        AttPdu::ReadBlobRsp(ReadRsp::new_blob(slice))
    } else {
        AttPdu::ReadRsp(ReadRsp::new_read(slice))
    }
}

/// Apply a write to a characteristic value or descriptor
///
/// Returns the success reply for requests; errors come back as `Err` so
/// commands can drop them silently.
fn server_reply_write<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    handle: u16,
    value: &[u8],
    with_response: bool,
) -> Result<AttPdu, AttPdu> {
    let caused = if with_response { AttOpcode::WriteReq } else { AttOpcode::WriteCmd };

    if inner.server.mode() == Mode::Nop {
        return Err(err_rsp(caused, handle, ErrorCode::AttributeNotFound));
    }

    let listeners = inner.server.listeners();
    let mut db = inner.server.db();

    match db.resolve_handle(handle) {
        Some(AttributeRef::CharValue { service, characteristic }) => {
            {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];

                let needed = if with_response {
                    Properties::WRITE_WITH_ACK
                } else {
                    Properties::WRITE_NO_ACK
                };
                if !c.properties.contains(needed) {
                    return Err(err_rsp(caused, handle, ErrorCode::WriteNotPermitted));
                }

                if !listeners.iter().all(|l| l.write_char_value(s, c, value, 0)) {
                    return Err(err_rsp(caused, handle, ErrorCode::WriteNotPermitted));
                }
            }

            if !db.services[service].characteristics[characteristic].set_value(value) {
                return Err(err_rsp(caused, handle, ErrorCode::InvalidAttributeValueLength));
            }

            let s = &db.services[service];
            let c = &s.characteristics[characteristic];
            listeners.iter().for_each(|l| l.write_char_value_done(s, c));

            Ok(AttPdu::WriteRsp(WriteRsp::new()))
        }
        Some(AttributeRef::Descriptor { service, characteristic, descriptor }) => {
            let is_cccd = {
                let d = &db.services[service].characteristics[characteristic]
                    .descriptors[descriptor];
                d.is_cccd()
            };

            if is_cccd && value.len() != 2 {
                return Err(err_rsp(caused, handle, ErrorCode::InvalidAttributeValueLength));
            }

            {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];
                let d = &c.descriptors[descriptor];

                if !listeners.iter().all(|l| l.write_desc_value(s, c, d, value, 0)) {
                    return Err(err_rsp(caused, handle, ErrorCode::WriteNotPermitted));
                }
            }

            if !db.services[service].characteristics[characteristic]
                .descriptors[descriptor].set_value(value)
            {
                return Err(err_rsp(caused, handle, ErrorCode::InvalidAttributeValueLength));
            }

            let s = &db.services[service];
            let c = &s.characteristics[characteristic];
            let d = &c.descriptors[descriptor];

            listeners.iter().for_each(|l| l.write_desc_value_done(s, c, d));

            if is_cccd {
                let (notify, indicate) = c.cccd_bits();
                listeners.iter()
                    .for_each(|l| l.client_char_config_changed(s, c, d, notify, indicate));
            }

            Ok(AttPdu::WriteRsp(WriteRsp::new()))
        }
        Some(_) => Err(err_rsp(caused, handle, ErrorCode::WriteNotPermitted)),
        None => Err(err_rsp(caused, handle, ErrorCode::InvalidHandle)),
    }
}

fn server_reply_prepare_write<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    p: &PrepareWrite,
) -> AttPdu {
    let caused = AttOpcode::PrepareWriteReq;
    let handle = p.handle();

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, handle, ErrorCode::AttributeNotFound);
    }

    {
        let listeners = inner.server.listeners();
        let db = inner.server.db();

        match db.resolve_handle(handle) {
            Some(AttributeRef::CharValue { service, characteristic }) => {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];

                if !c.properties.contains(Properties::WRITE_WITH_ACK) {
                    return err_rsp(caused, handle, ErrorCode::WriteNotPermitted);
                }
                if !listeners.iter().all(|l| l.write_char_value(s, c, p.value(), p.offset())) {
                    return err_rsp(caused, handle, ErrorCode::WriteNotPermitted);
                }
            }
            Some(AttributeRef::Descriptor { service, characteristic, descriptor }) => {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];
                let d = &c.descriptors[descriptor];

                if !listeners.iter().all(|l| l.write_desc_value(s, c, d, p.value(), p.offset())) {
                    return err_rsp(caused, handle, ErrorCode::WriteNotPermitted);
                }
            }
            Some(_) => return err_rsp(caused, handle, ErrorCode::WriteNotPermitted),
            None => return err_rsp(caused, handle, ErrorCode::InvalidHandle),
        }
    }

    let mut queue = inner.prepare_queue.lock().unwrap();

    if queue.chunks.len() >= PREPARE_QUEUE_CAPACITY {
        return err_rsp(caused, handle, ErrorCode::PrepareQueueFull);
    }

    // Chunks for one handle must be contiguous; a gap clears the queue.
    if p.offset() != queue.expected_offset(handle) {
        queue.clear();
        return err_rsp(caused, handle, ErrorCode::InvalidOffset);
    }

    queue.chunks.push(PrepareChunk {
        handle,
        offset: p.offset(),
        value: p.value().to_vec(),
    });
    queue.handles.push(handle);

    AttPdu::PrepareWriteRsp(PrepareWrite::new_rsp(handle, p.offset(), p.value()))
}

fn server_reply_execute_write<C: L2capChannel>(inner: &Arc<Inner<C>>, execute: bool) -> AttPdu {
    let caused = AttOpcode::ExecuteWriteReq;

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, 0, ErrorCode::AttributeNotFound);
    }

    let mut queue = inner.prepare_queue.lock().unwrap();

    if !execute {
        queue.clear();
        return AttPdu::ExecuteWriteRsp(ExecuteWriteRsp::new());
    }

    let listeners = inner.server.listeners();
    let mut db = inner.server.db();

    for chunk in queue.chunks.iter() {
        match db.resolve_handle(chunk.handle) {
            Some(AttributeRef::CharValue { service, characteristic }) => {
                let applied = db.services[service].characteristics[characteristic]
                    .write_at(chunk.offset as usize, &chunk.value);

                if !applied {
                    let handle = chunk.handle;
                    queue.clear();
                    return err_rsp(caused, handle, ErrorCode::InvalidOffset);
                }
            }
            Some(AttributeRef::Descriptor { service, characteristic, descriptor }) => {
                let applied = db.services[service].characteristics[characteristic]
                    .descriptors[descriptor]
                    .write_at(chunk.offset as usize, &chunk.value);

                if !applied {
                    let handle = chunk.handle;
                    queue.clear();
                    return err_rsp(caused, handle, ErrorCode::InvalidOffset);
                }
            }
            _ => {
                let handle = chunk.handle;
                queue.clear();
                return err_rsp(caused, handle, ErrorCode::InvalidHandle);
            }
        }
    }

    // Completion callbacks once per originating handle, in order
    let mut seen: Vec<u16> = Vec::new();
    for &handle in queue.handles.iter() {
        if seen.contains(&handle) {
            continue;
        }
        seen.push(handle);

        match db.resolve_handle(handle) {
            Some(AttributeRef::CharValue { service, characteristic }) => {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];
                listeners.iter().for_each(|l| l.write_char_value_done(s, c));
            }
            Some(AttributeRef::Descriptor { service, characteristic, descriptor }) => {
                let s = &db.services[service];
                let c = &s.characteristics[characteristic];
                let d = &c.descriptors[descriptor];
                listeners.iter().for_each(|l| l.write_desc_value_done(s, c, d));
            }
            _ => (),
        }
    }

    queue.clear();
    AttPdu::ExecuteWriteRsp(ExecuteWriteRsp::new())
}

fn uuid_bytes(uuid: Uuid) -> Vec<u8> {
    use core::convert::TryFrom as _;

    match <u16>::try_from(uuid) {
        Ok(v16) => v16.to_le_bytes().to_vec(),
        Err(_) => uuid.as_u128().to_le_bytes().to_vec(),
    }
}

fn server_reply_read_by_group_type<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    r: &TypeReq,
) -> AttPdu {
    let caused = AttOpcode::ReadByGroupTypeReq;

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }
    if r.attr_type() != PRIMARY_SERVICE_TYPE && r.attr_type() != SECONDARY_SERVICE_TYPE {
        return err_rsp(caused, r.start_handle(), ErrorCode::UnsupportedGroupType);
    }

    let want_primary = r.attr_type() == PRIMARY_SERVICE_TYPE;
    let db = inner.server.db();
    let mtu = inner.used_mtu();

    let mut element_size: Option<usize> = None;
    let mut elements: Vec<(u16, u16, Vec<u8>)> = Vec::new();

    for service in db.services.iter() {
        if service.primary != want_primary
            || service.handle < r.start_handle()
            || service.handle > r.end_handle()
        {
            continue;
        }

        let value = uuid_bytes(service.service_type);
        let this_size = 4 + value.len();

        match element_size {
            None => element_size = Some(this_size),
            // One response carries one width only
            Some(size) if size != this_size => break,
            Some(_) => (),
        }

        if (2 + (elements.len() + 1) * this_size) > mtu {
            break;
        }

        elements.push((service.handle, service.end_handle, value));
    }

    if elements.is_empty() {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    let element_size = element_size.unwrap();
    let mut rsp = ReadByGroupTypeRsp::alloc(
        element_size as u8,
        2 + elements.len() * element_size,
    )
    .unwrap();

    for (i, (handle, end, value)) in elements.iter().enumerate() {
        rsp.set_element_handle(i, *handle).unwrap();
        rsp.set_element_end_handle(i, *end).unwrap();
        rsp.set_element_value(i, value).unwrap();
    }
    rsp.set_element_count(elements.len()).unwrap();

    AttPdu::ReadByGroupTypeRsp(rsp)
}

fn server_reply_read_by_type<C: L2capChannel>(inner: &Arc<Inner<C>>, r: &TypeReq) -> AttPdu {
    let caused = AttOpcode::ReadByTypeReq;

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    let db = inner.server.db();
    let mtu = inner.used_mtu();

    let mut element_size: Option<usize> = None;
    let mut elements: Vec<(u16, Vec<u8>)> = Vec::new();

    {
        let mut push = |handle: u16, value: Vec<u8>| -> bool {
            let this_size = 2 + value.len();

            match element_size {
                None => element_size = Some(this_size),
                Some(size) if size != this_size => return false,
                Some(_) => (),
            }
            if (2 + (elements.len() + 1) * this_size) > mtu {
                return false;
            }

            elements.push((handle, value));
            true
        };

        'scan: for service in db.services.iter() {
            for characteristic in service.characteristics.iter() {
                if r.attr_type() == CHARACTERISTIC_TYPE {
                    let handle = characteristic.declaration_handle;

                    if handle < r.start_handle() || handle > r.end_handle() {
                        continue;
                    }

                    let mut value = alloc::vec![characteristic.properties.bits()];
                    value.extend_from_slice(&characteristic.value_handle.to_le_bytes());
                    value.extend_from_slice(&uuid_bytes(characteristic.char_type));

                    if !push(handle, value) {
                        break 'scan;
                    }
                } else if characteristic.char_type == r.attr_type() {
                    let handle = characteristic.value_handle;

                    if handle < r.start_handle() || handle > r.end_handle() {
                        continue;
                    }

                    let take = characteristic.value().len().min(mtu - 4).min(253);

                    if !push(handle, characteristic.value()[..take].to_vec()) {
                        break 'scan;
                    }
                }
            }
        }
    }

    if elements.is_empty() {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    let element_size = element_size.unwrap();
    let mut rsp = ReadByTypeRsp::alloc(
        element_size as u8,
        2 + elements.len() * element_size,
    )
    .unwrap();

    for (i, (handle, value)) in elements.iter().enumerate() {
        rsp.set_element_handle(i, *handle).unwrap();
        rsp.set_element_value(i, value).unwrap();
    }
    rsp.set_element_count(elements.len()).unwrap();

    AttPdu::ReadByTypeRsp(rsp)
}

fn server_reply_find_info<C: L2capChannel>(inner: &Arc<Inner<C>>, r: &FindInfoReq) -> AttPdu {
    let caused = AttOpcode::FindInfoReq;

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    let db = inner.server.db();
    let mtu = inner.used_mtu();

    // Every attribute in range with its type
    let mut attrs: Vec<(u16, Uuid)> = Vec::new();

    for service in db.services.iter() {
        let service_decl = if service.primary {
            PRIMARY_SERVICE_TYPE
        } else {
            SECONDARY_SERVICE_TYPE
        };
        attrs.push((service.handle, service_decl));

        for characteristic in service.characteristics.iter() {
            attrs.push((characteristic.declaration_handle, CHARACTERISTIC_TYPE));
            attrs.push((characteristic.value_handle, characteristic.char_type));

            for desc in characteristic.descriptors.iter() {
                attrs.push((desc.handle, desc.desc_type));
            }
        }
    }

    attrs.retain(|(h, _)| *h >= r.start_handle() && *h <= r.end_handle());
    attrs.sort_by_key(|(h, _)| *h);

    if attrs.is_empty() {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    // The first element fixes the format; the run stops at the first
    // width change.
    let first_is_16 = attrs[0].1.is_16_bit();
    let format = if first_is_16 {
        FindInfoRsp::FORMAT_UUID16
    } else {
        FindInfoRsp::FORMAT_UUID128
    };
    let element_size = if first_is_16 { 4 } else { 18 };

    let mut take = 0usize;
    for (_, uuid) in attrs.iter() {
        if uuid.is_16_bit() != first_is_16 {
            break;
        }
        if 2 + (take + 1) * element_size > mtu {
            break;
        }
        take += 1;
    }

    let mut rsp = FindInfoRsp::alloc(format, 2 + take * element_size).unwrap();

    for (i, (handle, uuid)) in attrs[..take].iter().enumerate() {
        rsp.set_element(i, *handle, *uuid).unwrap();
    }
    rsp.set_element_count(take).unwrap();

    AttPdu::FindInfoRsp(rsp)
}

fn server_reply_find_by_type_value<C: L2capChannel>(
    inner: &Arc<Inner<C>>,
    r: &crate::att::pdu::FindByTypeValueReq,
) -> AttPdu {
    let caused = AttOpcode::FindByTypeValueReq;

    if inner.server.mode() == Mode::Nop {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }
    if r.attr_type() != PRIMARY_SERVICE_TYPE && r.attr_type() != SECONDARY_SERVICE_TYPE {
        return err_rsp(caused, r.start_handle(), ErrorCode::UnsupportedGroupType);
    }

    let want_primary = r.attr_type() == PRIMARY_SERVICE_TYPE;
    let db = inner.server.db();
    let mtu = inner.used_mtu();

    let mut elements: Vec<(u16, u16)> = Vec::new();

    for service in db.services.iter() {
        if service.primary != want_primary
            || service.handle < r.start_handle()
            || service.handle > r.end_handle()
            || uuid_bytes(service.service_type) != r.value()
        {
            continue;
        }
        if 1 + (elements.len() + 1) * 4 > mtu {
            break;
        }

        elements.push((service.handle, service.end_handle));
    }

    if elements.is_empty() {
        return err_rsp(caused, r.start_handle(), ErrorCode::AttributeNotFound);
    }

    let mut rsp = FindByTypeValueRsp::alloc(1 + elements.len() * 4).unwrap();

    for (i, (found, end)) in elements.iter().enumerate() {
        rsp.set_element(i, *found, *end).unwrap();
    }
    rsp.set_element_count(elements.len()).unwrap();

    AttPdu::FindByTypeValueRsp(rsp)
}

#[cfg(test)]
mod test {
    use super::*;
    use super::super::server::{DbGattChar, DbGattDesc, DbGattService, DbGattServerListener};
    use crate::att::pdu::ExecuteWriteReq;
    use alloc::collections::VecDeque;
    use std::sync::Condvar;
    use std::time::Instant;

    /// Scripted in-memory L2CAP channel
    ///
    /// Frames pushed with `push_inbound` arrive at the handler's reader;
    /// frames the handler writes are recorded and optionally answered by
    /// the responder closure.
    struct MockChannel {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        available: Condvar,
        written: Mutex<Vec<Vec<u8>>>,
        responder: Mutex<Option<Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send>>>,
        open: std::sync::atomic::AtomicBool,
    }

    impl MockChannel {
        fn new() -> Arc<MockChannel> {
            Arc::new(MockChannel {
                inbound: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                written: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                open: std::sync::atomic::AtomicBool::new(true),
            })
        }

        fn with_responder<F>(responder: F) -> Arc<MockChannel>
        where F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static
        {
            let channel = Self::new();
            *channel.responder.lock().unwrap() = Some(Box::new(responder));
            channel
        }

        fn push_inbound(&self, frame: Vec<u8>) {
            self.inbound.lock().unwrap().push_back(frame);
            self.available.notify_all();
        }

        fn written_frames(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        /// Poll until `count` frames were written or the deadline passes
        fn wait_written(&self, count: usize) -> Vec<Vec<u8>> {
            let deadline = Instant::now() + Duration::from_secs(2);

            loop {
                let frames = self.written_frames();
                if frames.len() >= count || Instant::now() >= deadline {
                    return frames;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl L2capChannel for Arc<MockChannel> {
        fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, sock::Error> {
            let deadline = Instant::now() + timeout;
            let mut queue = self.inbound.lock().unwrap();

            loop {
                if !self.open.load(Ordering::SeqCst) {
                    return Err(sock::Error::NotConnected);
                }
                if let Some(frame) = queue.pop_front() {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Err(sock::Error::Timeout);
                }

                let (guard, _) = self.available.wait_timeout(queue, deadline - now).unwrap();
                queue = guard;
            }
        }

        fn write(&self, data: &[u8]) -> Result<usize, sock::Error> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(sock::Error::NotConnected);
            }

            self.written.lock().unwrap().push(data.to_vec());

            let replies = self.responder.lock().unwrap()
                .as_ref()
                .map(|r| r(data))
                .unwrap_or_default();

            for reply in replies {
                self.push_inbound(reply);
            }

            Ok(data.len())
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
            self.available.notify_all();
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn client_handler(channel: Arc<MockChannel>) -> Arc<GattHandler<Arc<MockChannel>>> {
        GattHandler::new(
            channel,
            GattRole::Client,
            Duration::from_millis(100),
            Arc::new(DbGattServer::new(Mode::Nop)),
        )
    }

    fn server_handler(
        channel: Arc<MockChannel>,
        server: Arc<DbGattServer>,
    ) -> Arc<GattHandler<Arc<MockChannel>>> {
        GattHandler::new(channel, GattRole::Server, Duration::from_millis(100), server)
    }

    /// The standard scripted remote of the discovery tests: MTU 100, two
    /// primary services without characteristics.
    fn discovery_responder(request: &[u8]) -> Vec<Vec<u8>> {
        match request[0] {
            0x02 => vec![vec![0x03, 100, 0]],
            0x10 => {
                let start = <u16>::from_le_bytes([request[1], request[2]]);

                if start == 0x0001 {
                    let mut rsp = ReadByGroupTypeRsp::alloc(6, 2 + 12).unwrap();
                    rsp.set_element_handle(0, 0x0001).unwrap();
                    rsp.set_element_end_handle(0, 0x0005).unwrap();
                    rsp.set_element_value(0, &0x1800u16.to_le_bytes()).unwrap();
                    rsp.set_element_handle(1, 0x0010).unwrap();
                    rsp.set_element_end_handle(1, 0x0014).unwrap();
                    rsp.set_element_value(1, &0x180Fu16.to_le_bytes()).unwrap();
                    rsp.set_element_count(2).unwrap();

                    vec![AttPdu::ReadByGroupTypeRsp(rsp).bytes().to_vec()]
                } else {
                    vec![AttPdu::ErrorRsp(ErrorRsp::new(0x10, start, ErrorCode::AttributeNotFound))
                        .bytes().to_vec()]
                }
            }
            0x08 => {
                let start = <u16>::from_le_bytes([request[1], request[2]]);
                vec![AttPdu::ErrorRsp(ErrorRsp::new(0x08, start, ErrorCode::AttributeNotFound))
                    .bytes().to_vec()]
            }
            op => panic!("unexpected request {:#04x}", op),
        }
    }

    #[test]
    fn primary_service_discovery_two_services() {
        let channel = MockChannel::with_responder(discovery_responder);
        let handler = client_handler(channel.clone());

        assert_eq!(Ok(InitStatus::Initialized), handler.init_client_gatt());

        handler.with_services(|services| {
            assert_eq!(2, services.len());

            assert_eq!(0x0001, services[0].start_handle);
            assert_eq!(0x0005, services[0].end_handle);
            assert_eq!(Uuid::from_u16(0x1800), services[0].service_type);

            assert_eq!(0x0010, services[1].start_handle);
            assert_eq!(0x0014, services[1].end_handle);
            assert_eq!(Uuid::from_u16(0x180F), services[1].service_type);
        });

        // Idempotent
        assert_eq!(Ok(InitStatus::AlreadyInitialized), handler.init_client_gatt());

        // The follow-up group request started past the last end handle
        let frames = channel.written_frames();
        let second_group = frames.iter()
            .filter(|f| f[0] == 0x10)
            .nth(1)
            .expect("second group request");
        assert_eq!(0x0015, <u16>::from_le_bytes([second_group[1], second_group[2]]));

        handler.disconnect(false, false);
    }

    #[test]
    fn mtu_exchange_loses_race() {
        let channel = MockChannel::with_responder(discovery_responder);
        let handler = client_handler(channel.clone());

        handler.init_client_gatt().unwrap();

        assert_eq!(100, handler.server_mtu());
        assert_eq!(100, handler.used_mtu());
        assert!(handler.mtu_exchanged());

        handler.disconnect(false, false);
    }

    #[test]
    fn long_read_blob_chain() {
        // 40 byte value at 0x0020, default MTU 23 (22 byte responses)
        let value: Vec<u8> = (0u8..40).collect();
        let script_value = value.clone();

        let channel = MockChannel::with_responder(move |request| {
            match request[0] {
                0x0A => vec![AttPdu::ReadRsp(ReadRsp::new_read(&script_value[..22]))
                    .bytes().to_vec()],
                0x0C => {
                    let offset =
                        <u16>::from_le_bytes([request[3], request[4]]) as usize;
                    vec![AttPdu::ReadBlobRsp(ReadRsp::new_blob(&script_value[offset..]))
                        .bytes().to_vec()]
                }
                op => panic!("unexpected request {:#04x}", op),
            }
        });
        let handler = client_handler(channel.clone());

        let read = handler.read_value(0x0020, -1).unwrap();

        assert_eq!(value, read);

        // Read-Req, then one blob from offset 22; the 18 byte short reply
        // ends the chain
        let frames = channel.written_frames();
        assert_eq!(2, frames.len());
        assert_eq!(0x0C, frames[1][0]);
        assert_eq!(22, <u16>::from_le_bytes([frames[1][3], frames[1][4]]));

        handler.disconnect(false, false);
    }

    #[test]
    fn long_read_until_empty_blob() {
        // 44 bytes: both blob replies are full, the empty one terminates
        let value: Vec<u8> = (0u8..44).collect();
        let script_value = value.clone();

        let channel = MockChannel::with_responder(move |request| {
            match request[0] {
                0x0A => vec![AttPdu::ReadRsp(ReadRsp::new_read(&script_value[..22]))
                    .bytes().to_vec()],
                0x0C => {
                    let offset =
                        <u16>::from_le_bytes([request[3], request[4]]) as usize;
                    let end = (offset + 22).min(script_value.len());
                    vec![AttPdu::ReadBlobRsp(ReadRsp::new_blob(&script_value[offset..end]))
                        .bytes().to_vec()]
                }
                op => panic!("unexpected request {:#04x}", op),
            }
        });
        let handler = client_handler(channel.clone());

        let read = handler.read_value(0x0020, -1).unwrap();

        assert_eq!(value, read);

        let frames = channel.written_frames();
        assert_eq!(3, frames.len());
        assert_eq!(44, <u16>::from_le_bytes([frames[2][3], frames[2][4]]));

        handler.disconnect(false, false);
    }

    #[test]
    fn expected_length_zero_is_single_read() {
        let channel = MockChannel::with_responder(|request| {
            assert_eq!(0x0A, request[0]);
            vec![AttPdu::ReadRsp(ReadRsp::new_read(&[0xAB; 22])).bytes().to_vec()]
        });
        let handler = client_handler(channel.clone());

        let read = handler.read_value(0x0020, 0).unwrap();

        assert_eq!(22, read.len());
        assert_eq!(1, channel.written_frames().len());

        handler.disconnect(false, false);
    }

    struct RecordingListener {
        notifications: Mutex<Vec<Vec<u8>>>,
        indications: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<RecordingListener> {
            Arc::new(RecordingListener {
                notifications: Mutex::new(Vec::new()),
                indications: Mutex::new(Vec::new()),
            })
        }
    }

    impl GattCharListener for RecordingListener {
        fn notification_received(
            &self,
            _service: &GattService,
            _characteristic: &GattCharacteristic,
            value: &[u8],
        ) {
            self.notifications.lock().unwrap().push(value.to_vec());
        }

        fn indication_received(
            &self,
            _service: &GattService,
            _characteristic: &GattCharacteristic,
            value: &[u8],
            confirmation_sent: bool,
        ) {
            self.indications.lock().unwrap().push((value.to_vec(), confirmation_sent));
        }
    }

    fn seed_service(handler: &GattHandler<Arc<MockChannel>>, value_handle: u16) {
        handler.inner.services.lock().unwrap().push(GattService {
            start_handle: 0x0020,
            end_handle: 0x0040,
            service_type: Uuid::from_u16(0x1809),
            primary: true,
            characteristics: alloc::vec![GattCharacteristic {
                declaration_handle: value_handle - 1,
                value_handle,
                end_handle: 0x0040,
                properties: Properties::NOTIFY | Properties::INDICATE,
                char_type: Uuid::from_u16(0x2A1C),
                value: Vec::new(),
                descriptors: Vec::new(),
                cccd_index: None,
                user_description_index: None,
                notify_enabled: false,
                indicate_enabled: false,
            }],
        });
    }

    #[test]
    fn indication_confirms_after_listener_dispatch() {
        let channel = MockChannel::new();
        let handler = client_handler(channel.clone());
        let listener = RecordingListener::new();

        seed_service(&handler, 0x0030);
        handler.add_listener(listener.clone());

        channel.push_inbound(
            AttPdu::HandleValueInd(HandleValuePdu::new_indication(0x0030, b"ping"))
                .bytes().to_vec(),
        );

        let frames = channel.wait_written(1);
        assert_eq!(vec![vec![0x1Eu8]], frames);
        assert_eq!(
            alloc::vec![(b"ping".to_vec(), true)],
            listener.indications.lock().unwrap().clone()
        );

        // With auto-confirmation off only the listener runs
        handler.set_send_indication_confirmation(false);
        channel.push_inbound(
            AttPdu::HandleValueInd(HandleValuePdu::new_indication(0x0030, b"pong"))
                .bytes().to_vec(),
        );

        let deadline = Instant::now() + Duration::from_millis(500);
        while listener.indications.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(1, channel.written_frames().len());
        assert_eq!(
            (b"pong".to_vec(), false),
            listener.indications.lock().unwrap()[1].clone()
        );

        handler.disconnect(false, false);
    }

    #[test]
    fn notification_fan_out_without_confirmation() {
        let channel = MockChannel::new();
        let handler = client_handler(channel.clone());
        let listener = RecordingListener::new();

        seed_service(&handler, 0x0030);
        handler.add_listener(listener.clone());

        channel.push_inbound(
            AttPdu::HandleValueNtf(HandleValuePdu::new_notification(0x0030, b"beat"))
                .bytes().to_vec(),
        );

        let deadline = Instant::now() + Duration::from_millis(500);
        while listener.notifications.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(alloc::vec![b"beat".to_vec()], listener.notifications.lock().unwrap().clone());
        assert!(channel.written_frames().is_empty());

        handler.disconnect(false, false);
    }

    struct DoneCounter {
        done: Mutex<usize>,
    }

    impl DbGattServerListener for DoneCounter {
        fn write_char_value_done(
            &self,
            _service: &DbGattService,
            _characteristic: &DbGattChar,
        ) {
            *self.done.lock().unwrap() += 1;
        }
    }

    fn writable_server() -> (Arc<DbGattServer>, u16) {
        let server = Arc::new(DbGattServer::new(Mode::Db));

        server.add_service(
            DbGattService::new(true, Uuid::from_u16(0x1809))
                .with_char(
                    DbGattChar::new(
                        Uuid::from_u16(0x2A1C),
                        Properties::READ | Properties::WRITE_WITH_ACK | Properties::INDICATE,
                        Vec::new(),
                        true,
                    )
                    .with_capacity(16)
                    .with_descriptor(DbGattDesc::cccd()),
                ),
        );

        let value_handle = server.db().services[0].characteristics[0].value_handle;
        (server, value_handle)
    }

    #[test]
    fn prepare_write_gap_rejected() {
        let (server, value_handle) = writable_server();
        let done = Arc::new(DoneCounter { done: Mutex::new(0) });
        server.add_listener(done.clone());

        let channel = MockChannel::new();
        let handler = server_handler(channel.clone(), server.clone());

        channel.push_inbound(
            AttPdu::PrepareWriteReq(PrepareWrite::new_req(value_handle, 0, b"abcd"))
                .bytes().to_vec(),
        );
        channel.push_inbound(
            AttPdu::PrepareWriteReq(PrepareWrite::new_req(value_handle, 8, b"ef"))
                .bytes().to_vec(),
        );

        let frames = channel.wait_written(2);

        // Echoed response, then the gap rejection
        assert_eq!(0x17, frames[0][0]);
        assert_eq!(0x01, frames[1][0]);
        assert_eq!(ErrorCode::InvalidOffset.to_raw(), frames[1][4]);

        // The queue was cleared: executing now applies nothing
        channel.push_inbound(
            AttPdu::ExecuteWriteReq(ExecuteWriteReq::new(true)).bytes().to_vec(),
        );

        let frames = channel.wait_written(3);
        assert_eq!(0x19, frames[2][0]);
        assert_eq!(0, *done.done.lock().unwrap());
        assert!(server.db().services[0].characteristics[0].value().is_empty());

        handler.disconnect(false, false);
    }

    #[test]
    fn prepare_write_contiguous_then_execute() {
        let (server, value_handle) = writable_server();
        let done = Arc::new(DoneCounter { done: Mutex::new(0) });
        server.add_listener(done.clone());

        let channel = MockChannel::new();
        let handler = server_handler(channel.clone(), server.clone());

        channel.push_inbound(
            AttPdu::PrepareWriteReq(PrepareWrite::new_req(value_handle, 0, b"abcd"))
                .bytes().to_vec(),
        );
        channel.push_inbound(
            AttPdu::PrepareWriteReq(PrepareWrite::new_req(value_handle, 4, b"ef"))
                .bytes().to_vec(),
        );
        channel.push_inbound(
            AttPdu::ExecuteWriteReq(ExecuteWriteReq::new(true)).bytes().to_vec(),
        );

        let frames = channel.wait_written(3);

        assert_eq!(0x17, frames[0][0]);
        assert_eq!(0x17, frames[1][0]);
        assert_eq!(0x19, frames[2][0]);

        assert_eq!(b"abcdef", server.db().services[0].characteristics[0].value());
        assert_eq!(1, *done.done.lock().unwrap());

        handler.disconnect(false, false);
    }

    #[test]
    fn server_cccd_write_fans_config_change() {
        struct CccdRecorder {
            seen: Mutex<Vec<(bool, bool)>>,
        }

        impl DbGattServerListener for CccdRecorder {
            fn client_char_config_changed(
                &self,
                _service: &DbGattService,
                _characteristic: &DbGattChar,
                _descriptor: &DbGattDesc,
                notify_enabled: bool,
                indicate_enabled: bool,
            ) {
                self.seen.lock().unwrap().push((notify_enabled, indicate_enabled));
            }
        }

        let (server, _) = writable_server();
        let recorder = Arc::new(CccdRecorder { seen: Mutex::new(Vec::new()) });
        server.add_listener(recorder.clone());

        let cccd_handle = server.db().services[0].characteristics[0]
            .descriptors[0].handle;

        let channel = MockChannel::new();
        let handler = server_handler(channel.clone(), server.clone());

        // Wrong width first
        channel.push_inbound(
            AttPdu::WriteReq(HandleValuePdu::new_write_req(cccd_handle, &[0x02]))
                .bytes().to_vec(),
        );
        channel.push_inbound(
            AttPdu::WriteReq(HandleValuePdu::new_write_req(cccd_handle, &[0x02, 0x00]))
                .bytes().to_vec(),
        );

        let frames = channel.wait_written(2);

        assert_eq!(0x01, frames[0][0]);
        assert_eq!(ErrorCode::InvalidAttributeValueLength.to_raw(), frames[0][4]);
        assert_eq!(0x13, frames[1][0]);

        assert_eq!(alloc::vec![(false, true)], recorder.seen.lock().unwrap().clone());
        assert_eq!(
            (false, true),
            server.db().services[0].characteristics[0].cccd_bits()
        );

        handler.disconnect(false, false);
    }

    #[test]
    fn server_discovery_round() {
        let (server, value_handle) = writable_server();
        let channel = MockChannel::new();
        let handler = server_handler(channel.clone(), server.clone());

        channel.push_inbound(
            AttPdu::ReadByGroupTypeReq(TypeReq::new_read_by_group_type(
                0x0001, 0xFFFF, PRIMARY_SERVICE_TYPE,
            )).bytes().to_vec(),
        );

        let frames = channel.wait_written(1);
        match AttPdu::parse(Octets::from_slice(&frames[0])).unwrap() {
            AttPdu::ReadByGroupTypeRsp(rsp) => {
                assert_eq!(1, rsp.element_count());
                assert_eq!(1, rsp.element_handle(0).unwrap());
                assert_eq!(4, rsp.element_end_handle(0).unwrap());
                assert_eq!(&0x1809u16.to_le_bytes(), rsp.element_value(0).unwrap());
            }
            other => panic!("wrong reply {}", other),
        }

        channel.push_inbound(
            AttPdu::ReadReq(ReadReq::new(value_handle + 1)).bytes().to_vec(),
        );

        let frames = channel.wait_written(2);
        match AttPdu::parse(Octets::from_slice(&frames[1])).unwrap() {
            AttPdu::ReadRsp(rsp) => assert_eq!(&[0u8, 0u8], rsp.value()),
            other => panic!("wrong reply {}", other),
        }

        handler.disconnect(false, false);
    }

    #[test]
    fn server_find_info_and_read_by_type() {
        let (server, value_handle) = writable_server();
        let channel = MockChannel::new();
        let handler = server_handler(channel.clone(), server.clone());

        channel.push_inbound(
            AttPdu::FindInfoReq(FindInfoReq::new(0x0001, 0xFFFF)).bytes().to_vec(),
        );

        let frames = channel.wait_written(1);
        match AttPdu::parse(Octets::from_slice(&frames[0])).unwrap() {
            AttPdu::FindInfoRsp(rsp) => {
                // service decl, char decl, char value, cccd
                assert_eq!(FindInfoRsp::FORMAT_UUID16, rsp.format());
                assert_eq!(4, rsp.element_count());
                assert_eq!(PRIMARY_SERVICE_TYPE, rsp.element_uuid(0).unwrap());
                assert_eq!(CHARACTERISTIC_TYPE, rsp.element_uuid(1).unwrap());
                assert_eq!(Uuid::from_u16(0x2A1C), rsp.element_uuid(2).unwrap());
                assert_eq!(CLIENT_CHAR_CONFIG_TYPE, rsp.element_uuid(3).unwrap());
            }
            other => panic!("wrong reply {}", other),
        }

        channel.push_inbound(
            AttPdu::ReadByTypeReq(TypeReq::new_read_by_type(
                0x0001, 0xFFFF, CHARACTERISTIC_TYPE,
            )).bytes().to_vec(),
        );

        let frames = channel.wait_written(2);
        match AttPdu::parse(Octets::from_slice(&frames[1])).unwrap() {
            AttPdu::ReadByTypeRsp(rsp) => {
                assert_eq!(1, rsp.element_count());

                let value = rsp.element_value(0).unwrap();
                assert_eq!(
                    (Properties::READ | Properties::WRITE_WITH_ACK | Properties::INDICATE).bits(),
                    value[0]
                );
                assert_eq!(value_handle, <u16>::from_le_bytes([value[1], value[2]]));
                assert_eq!(0x2A1Cu16.to_le_bytes(), [value[3], value[4]]);
            }
            other => panic!("wrong reply {}", other),
        }

        handler.disconnect(false, false);
    }

    #[test]
    fn configure_notifications_checks_properties() {
        let channel = MockChannel::with_responder(|request| {
            match request[0] {
                0x12 => vec![AttPdu::WriteRsp(WriteRsp::new()).bytes().to_vec()],
                op => panic!("unexpected request {:#04x}", op),
            }
        });
        let handler = client_handler(channel.clone());

        // Notify-only characteristic with a CCCD at 0x0031
        handler.inner.services.lock().unwrap().push(GattService {
            start_handle: 0x0020,
            end_handle: 0x0040,
            service_type: Uuid::from_u16(0x180D),
            primary: true,
            characteristics: alloc::vec![GattCharacteristic {
                declaration_handle: 0x002F,
                value_handle: 0x0030,
                end_handle: 0x0040,
                properties: Properties::NOTIFY,
                char_type: Uuid::from_u16(0x2A37),
                value: Vec::new(),
                descriptors: alloc::vec![GattDescriptor {
                    handle: 0x0031,
                    desc_type: CLIENT_CHAR_CONFIG_TYPE,
                    value: Vec::new(),
                }],
                cccd_index: Some(0),
                user_description_index: None,
                notify_enabled: false,
                indicate_enabled: false,
            }],
        });

        // Indications are not advertised
        assert_eq!(
            Err(GattError::InvalidParameter("characteristic cannot indicate")),
            handler.configure_notifications(0x0030, false, true)
        );

        handler.configure_notifications(0x0030, true, false).unwrap();

        let frames = channel.written_frames();
        assert_eq!(1, frames.len());
        assert_eq!(0x12, frames[0][0]);
        assert_eq!(0x0031, <u16>::from_le_bytes([frames[0][1], frames[0][2]]));
        assert_eq!(&[0x01, 0x00], &frames[0][3..5]);

        handler.with_services(|services| {
            assert!(services[0].characteristics[0].notify_enabled);
            assert!(!services[0].characteristics[0].indicate_enabled);
        });

        handler.disconnect(false, false);
    }

    #[test]
    fn write_exceeding_mtu_fails_locally() {
        let channel = MockChannel::new();
        let handler = client_handler(channel.clone());

        // Default MTU 23: 21 bytes do not fit a write request
        let result = handler.write_value(0x0030, &[0u8; 21]);

        assert_eq!(Err(GattError::MtuExceeded { size: 24, mtu: 23 }), result);
        assert!(channel.written_frames().is_empty());

        assert_eq!(Ok(()), handler.write_value_no_resp(0x0030, &[0u8; 20]));
        assert_eq!(1, channel.written_frames().len());

        handler.disconnect(false, false);
    }

    #[test]
    fn disconnect_fails_pending_and_further_calls() {
        let channel = MockChannel::new();
        let handler = client_handler(channel.clone());

        let waiter_handler = handler.clone();
        let waiter = thread::spawn(move || {
            waiter_handler.read_value(0x0030, 0)
        });

        thread::sleep(Duration::from_millis(50));
        handler.disconnect(false, false);

        assert_eq!(Err(GattError::NotConnected), waiter.join().unwrap());
        assert!(!handler.is_connected());
        assert_eq!(
            Err(GattError::NotConnected),
            handler.write_value(0x0030, &[1])
        );
    }

    #[test]
    fn unknown_request_answered_unsupported() {
        let channel = MockChannel::new();
        let handler = client_handler(channel.clone());

        // 0x3A is no known opcode and not flagged as a command
        channel.push_inbound(alloc::vec![0x3A, 0x01, 0x02]);

        let frames = channel.wait_written(1);
        assert_eq!(
            alloc::vec![0x01u8, 0x3A, 0x00, 0x00, ErrorCode::RequestNotSupported.to_raw()],
            frames[0]
        );

        handler.disconnect(false, false);
    }
}
