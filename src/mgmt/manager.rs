//! The management channel dispatcher
//!
//! One reader thread polls the kernel control socket. Command replies feed
//! a bounded reply ring; INDEX_ADDED/INDEX_REMOVED spawn detached worker
//! threads so adapter initialization never blocks the reader; every other
//! event fans out synchronously to the registered per-opcode callbacks.
//!
//! Commands are strictly serialized process-wide: the command mutex is held
//! across the whole request/reply round trip, so a new command cannot start
//! until the current one completed or timed out.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::{
    AdapterInfo,
    BtMode,
    Error,
    MgmtCommand,
    MgmtEvent,
    MgmtEventOpcode,
    MgmtStatus,
};
use crate::buffer::Octets;
use crate::config::MgmtEnv;
use crate::eir::EirReport;
use crate::ring::{self, RingBuffer};
use crate::sock;
use crate::BluetoothDeviceAddress;

/// Largest frame the control channel delivers
const READ_BUFFER_SIZE: usize = 1024;

/// Callback for management events, invoked on the reader thread or an
/// index worker thread; must return promptly
pub type MgmtEventCallback = Arc<dyn Fn(&MgmtEvent) + Send + Sync>;

/// Callback for adapter-set changes `(added, info)`
pub type AdapterSetCallback = Arc<dyn Fn(bool, &AdapterInfo) + Send + Sync>;

/// Callback for DEVICE_FOUND events with the advertising data decoded
pub type DeviceFoundCallback =
    Arc<dyn Fn(u16, &BluetoothDeviceAddress, u8, i8, &EirReport) + Send + Sync>;

/// The byte channel the dispatcher drives
///
/// Implemented by [`HciSocket`](crate::hci::HciSocket) on the control
/// channel; tests provide scripted in-memory channels.
pub trait ControlChannel: Send + Sync {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, sock::Error>;
    fn write(&self, data: &[u8]) -> Result<usize, sock::Error>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

#[cfg(target_os = "linux")]
impl ControlChannel for crate::hci::HciSocket {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, sock::Error> {
        crate::hci::HciSocket::read(self, buf, timeout)
    }

    fn write(&self, data: &[u8]) -> Result<usize, sock::Error> {
        crate::hci::HciSocket::write(self, data)
    }

    fn close(&self) {
        crate::hci::HciSocket::close(self)
    }

    fn is_open(&self) -> bool {
        crate::hci::HciSocket::is_open(self)
    }
}

struct EventCallbackEntry {
    dev_id: Option<u16>,
    callback: MgmtEventCallback,
}

struct ManagerInner<S: ControlChannel> {
    channel: S,
    reply_ring: RingBuffer<MgmtEvent>,
    closed: AtomicBool,
    cmd_mtx: Mutex<()>,
    cmd_timeout: Duration,
    default_btmode: BtMode,
    debug_event: bool,
    /// Per-opcode callback lists, copy-on-write snapshots
    event_callbacks: Mutex<BTreeMap<u16, Arc<Vec<EventCallbackEntry>>>>,
    adapter_set_callbacks: Mutex<Arc<Vec<AdapterSetCallback>>>,
    device_found_callbacks: Mutex<Arc<Vec<DeviceFoundCallback>>>,
    /// Present adapters, copy-on-write snapshot
    adapters: Mutex<Arc<Vec<AdapterInfo>>>,
    /// Whitelist entries this process added, removed again on close
    whitelist: Mutex<Vec<(u16, BluetoothDeviceAddress, u8)>>,
}

impl<S: ControlChannel + 'static> ManagerInner<S> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialized command round trip
    ///
    /// Unmatched replies are discarded; after ring-capacity mismatches or
    /// on deadline the command fails with [`Error::Timeout`].
    fn send_with_reply(&self, cmd: &MgmtCommand) -> Result<MgmtEvent, Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.send_with_reply_raw(cmd)
    }

    /// The round trip itself, also used by `close` for its final commands
    fn send_with_reply_raw(&self, cmd: &MgmtCommand) -> Result<MgmtEvent, Error> {
        let _cmd_guard = self.cmd_mtx.lock().unwrap();

        if self.debug_event {
            log::debug!("mgmt TX: {}", cmd);
        }

        match self.channel.write(cmd.bytes()) {
            Ok(_) => (),
            Err(sock::Error::NotConnected) => return Err(Error::NotConnected),
            Err(e) => {
                log::warn!("mgmt send failed: {}", e);
                return Err(Error::IoError);
            }
        }

        let deadline = std::time::Instant::now() + self.cmd_timeout;
        let mut mismatches = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());

            let reply = self.reply_ring.get(remaining).map_err(|e| match e {
                ring::Error::Timeout => Error::Timeout,
                _ => Error::NotConnected,
            })?;

            if reply.answers(cmd) {
                return Ok(reply);
            }

            log::debug!("discarding unmatched mgmt reply {}", reply);
            mismatches += 1;

            if mismatches >= self.reply_ring.capacity() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Round trip requiring CMD_COMPLETE with success; returns its data
    fn send_checked(&self, cmd: &MgmtCommand) -> Result<Vec<u8>, Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.send_checked_raw(cmd)
    }

    fn send_checked_raw(&self, cmd: &MgmtCommand) -> Result<Vec<u8>, Error> {
        let reply = self.send_with_reply_raw(cmd)?;

        if let Some((_, status, data)) = reply.cmd_complete() {
            return match status {
                MgmtStatus::Success => Ok(data.to_vec()),
                other => Err(Error::Status(other)),
            };
        }
        if let Some((_, status)) = reply.cmd_status() {
            return Err(Error::Status(status));
        }

        Err(Error::Timeout)
    }

    fn adapters_snapshot(&self) -> Arc<Vec<AdapterInfo>> {
        self.adapters.lock().unwrap().clone()
    }

    fn store_adapter(&self, info: AdapterInfo) {
        let mut guard = self.adapters.lock().unwrap();
        let mut next = guard.as_ref().clone();

        next.retain(|a| a.dev_id != info.dev_id);
        next.push(info);
        next.sort_by_key(|a| a.dev_id);
        *guard = Arc::new(next);
    }

    fn take_adapter(&self, dev_id: u16) -> Option<AdapterInfo> {
        let mut guard = self.adapters.lock().unwrap();
        let removed = guard.iter().find(|a| a.dev_id == dev_id).cloned();

        if removed.is_some() {
            let mut next = guard.as_ref().clone();
            next.retain(|a| a.dev_id != dev_id);
            *guard = Arc::new(next);
        }
        removed
    }

    fn fan_adapter_set(&self, added: bool, info: &AdapterInfo) {
        if self.is_closed() {
            return;
        }

        let callbacks = self.adapter_set_callbacks.lock().unwrap().clone();

        for callback in callbacks.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(added, info)
            }));

            if result.is_err() {
                log::error!("adapter-set callback panicked; continuing");
            }
        }
    }

    /// Bring a newly found adapter into the requested mode
    ///
    /// READ_INFO, mode flags per the configured [`BtMode`], connectable
    /// off, whitelist cleared, powered on, then a second READ_INFO to
    /// capture the resulting settings.
    fn initialize_adapter(&self, dev_id: u16) -> Result<AdapterInfo, Error> {
        let data = self.send_checked(&MgmtCommand::read_info(dev_id)).map_err(|e| {
            match e {
                Error::Status(MgmtStatus::InvalidIndex) => Error::InvalidIndex(dev_id),
                other => other,
            }
        })?;
        let info = AdapterInfo::parse(dev_id, &data)?;

        log::debug!("initializing {}", info);

        // Mode setters can be refused depending on the current state;
        // refusal is logged, initialization continues.
        let mode_cmds: Vec<MgmtCommand> = match self.default_btmode {
            BtMode::Dual => alloc::vec![
                MgmtCommand::set_ssp(dev_id, true),
                MgmtCommand::set_bredr(dev_id, true),
                MgmtCommand::set_le(dev_id, true),
            ],
            BtMode::BrEdr => alloc::vec![
                MgmtCommand::set_bredr(dev_id, true),
                MgmtCommand::set_ssp(dev_id, true),
                MgmtCommand::set_le(dev_id, false),
            ],
            BtMode::Le => alloc::vec![
                MgmtCommand::set_le(dev_id, true),
                MgmtCommand::set_bredr(dev_id, false),
                MgmtCommand::set_ssp(dev_id, false),
            ],
        };

        for cmd in mode_cmds.iter()
            .chain([
                MgmtCommand::set_connectable(dev_id, false),
                MgmtCommand::set_fast_connectable(dev_id, false),
                MgmtCommand::remove_device_whitelist(dev_id, &[0u8; 6], 0),
            ].iter())
        {
            if let Err(e) = self.send_checked(cmd) {
                log::info!("{} during init of dev {}: {}", cmd, dev_id, e);
            }
        }

        self.send_checked(&MgmtCommand::set_powered(dev_id, true))?;

        let data = self.send_checked(&MgmtCommand::read_info(dev_id))?;
        let info = AdapterInfo::parse(dev_id, &data)?;

        self.store_adapter(info.clone());
        Ok(info)
    }

    /// Synchronous per-opcode callback fan-out
    fn dispatch_callbacks(&self, event: &MgmtEvent) {
        if self.is_closed() {
            return;
        }

        if let Some((address, address_type, rssi, _, eir)) = event.device_found() {
            let report = EirReport::parse_data(eir);
            let callbacks = self.device_found_callbacks.lock().unwrap().clone();

            for callback in callbacks.iter() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(event.dev_id(), &address, address_type, rssi, &report)
                }));

                if result.is_err() {
                    log::error!("device-found callback panicked; continuing");
                }
            }
        }

        let snapshot = self.event_callbacks.lock().unwrap()
            .get(&event.opcode_raw())
            .cloned();

        let entries = match snapshot {
            Some(entries) => entries,
            None => return,
        };

        for entry in entries.iter() {
            if let Some(dev_id) = entry.dev_id {
                if dev_id != event.dev_id() {
                    continue;
                }
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (entry.callback)(event)
            }));

            if result.is_err() {
                log::error!("mgmt event callback panicked; continuing");
            }
        }
    }
}

/// The management channel dispatcher
///
/// Owns the control socket and the reader thread. All registration is
/// identity-based (`Arc` address), deduplicated, in insertion order.
pub struct Manager<S: ControlChannel + 'static> {
    inner: Arc<ManagerInner<S>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    reader_thread_id: Mutex<Option<thread::ThreadId>>,
}

impl<S: ControlChannel + 'static> Manager<S> {
    /// Start the dispatcher over an open control channel
    ///
    /// Spawns the reader, queries the kernel version and index list, and
    /// initializes every adapter already present.
    pub fn new(channel: S) -> Result<Manager<S>, Error> {
        let env = MgmtEnv::get();

        let inner = Arc::new(ManagerInner {
            channel,
            reply_ring: RingBuffer::new(env.evt_ring_capacity),
            closed: AtomicBool::new(false),
            cmd_mtx: Mutex::new(()),
            cmd_timeout: env.command_reply_timeout,
            default_btmode: env.default_btmode,
            debug_event: env.debug_event,
            event_callbacks: Mutex::new(BTreeMap::new()),
            adapter_set_callbacks: Mutex::new(Arc::new(Vec::new())),
            device_found_callbacks: Mutex::new(Arc::new(Vec::new())),
            adapters: Mutex::new(Arc::new(Vec::new())),
            whitelist: Mutex::new(Vec::new()),
        });

        let reader_inner = inner.clone();
        let reader_poll = env.reader_poll_timeout;
        let handle = thread::spawn(move || reader_loop(reader_inner, reader_poll));

        let manager = Manager {
            reader_thread_id: Mutex::new(Some(handle.thread().id())),
            reader: Mutex::new(Some(handle)),
            inner,
        };

        match manager.inner.send_checked(&MgmtCommand::read_version()) {
            Ok(data) if data.len() >= 3 => {
                log::info!("mgmt version {}.{}",
                    data[0], <u16>::from_le_bytes([data[1], data[2]]));
            }
            Ok(_) => log::warn!("short mgmt version reply"),
            Err(e) => {
                manager.close();
                return Err(e);
            }
        }

        let index_data = match manager.inner.send_checked(&MgmtCommand::read_index_list()) {
            Ok(data) => data,
            Err(e) => {
                manager.close();
                return Err(e);
            }
        };

        let count = if index_data.len() >= 2 {
            <u16>::from_le_bytes([index_data[0], index_data[1]]) as usize
        } else {
            0
        };

        for i in 0..count {
            let at = 2 + i * 2;
            if at + 2 > index_data.len() {
                break;
            }

            let dev_id = <u16>::from_le_bytes([index_data[at], index_data[at + 1]]);

            if let Err(e) = manager.inner.initialize_adapter(dev_id) {
                log::warn!("failed to initialize adapter {}: {}", dev_id, e);
            }
        }

        Ok(manager)
    }

    /// The currently present adapters
    pub fn adapters(&self) -> Vec<AdapterInfo> {
        self.inner.adapters_snapshot().as_ref().clone()
    }

    pub fn adapter(&self, dev_id: u16) -> Option<AdapterInfo> {
        self.inner.adapters_snapshot().iter().find(|a| a.dev_id == dev_id).cloned()
    }

    /// Issue a command and wait for its reply event
    pub fn send_with_reply(&self, cmd: &MgmtCommand) -> Result<MgmtEvent, Error> {
        self.inner.send_with_reply(cmd)
    }

    /// Issue a command requiring successful completion
    pub fn send_checked(&self, cmd: &MgmtCommand) -> Result<Vec<u8>, Error> {
        self.inner.send_checked(cmd)
    }

    fn require_adapter(&self, dev_id: u16) -> Result<(), Error> {
        if self.inner.adapters_snapshot().iter().any(|a| a.dev_id == dev_id) {
            Ok(())
        } else {
            Err(Error::InvalidIndex(dev_id))
        }
    }

    pub fn set_powered(&self, dev_id: u16, on: bool) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        self.inner.send_checked(&MgmtCommand::set_powered(dev_id, on)).map(drop)
    }

    pub fn set_bondable(&self, dev_id: u16, on: bool) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        self.inner.send_checked(&MgmtCommand::set_bondable(dev_id, on)).map(drop)
    }

    pub fn set_discoverable(&self, dev_id: u16, discoverable: u8, timeout: u16) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        self.inner
            .send_checked(&MgmtCommand::set_discoverable(dev_id, discoverable, timeout))
            .map(drop)
    }

    pub fn set_local_name(&self, dev_id: u16, name: &str, short_name: &str) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        self.inner
            .send_checked(&MgmtCommand::set_local_name(dev_id, name, short_name))
            .map(drop)
    }

    /// Start discovery with the scan type of the configured mode
    pub fn start_discovery(&self, dev_id: u16) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        let scan_type = MgmtCommand::scan_type_of(self.inner.default_btmode);
        self.inner
            .send_checked(&MgmtCommand::start_discovery(dev_id, scan_type))
            .map(drop)
    }

    pub fn stop_discovery(&self, dev_id: u16) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        let scan_type = MgmtCommand::scan_type_of(self.inner.default_btmode);
        self.inner
            .send_checked(&MgmtCommand::stop_discovery(dev_id, scan_type))
            .map(drop)
    }

    /// Add a device to the kernel whitelist, tracked for removal on close
    pub fn add_device_whitelist(
        &self,
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        action: u8,
    ) -> Result<(), Error> {
        self.require_adapter(dev_id)?;
        self.inner.send_checked(
            &MgmtCommand::add_device_whitelist(dev_id, address, address_type, action),
        )?;

        self.inner.whitelist.lock().unwrap().push((dev_id, *address, address_type));
        Ok(())
    }

    pub fn remove_device_whitelist(
        &self,
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
    ) -> Result<(), Error> {
        self.inner.whitelist.lock().unwrap()
            .retain(|(d, a, t)| !(*d == dev_id && a == address && *t == address_type));

        self.inner.send_checked(
            &MgmtCommand::remove_device_whitelist(dev_id, address, address_type),
        ).map(drop)
    }

    /// Disconnect a device
    ///
    /// A DEVICE_DISCONNECTED event is synthesized to the registered
    /// callbacks even though the local side initiated the teardown; remote
    /// stacks do not always send one on a dying link.
    pub fn disconnect_device(
        &self,
        dev_id: u16,
        address: &BluetoothDeviceAddress,
        address_type: u8,
        reason: u8,
    ) -> Result<(), Error> {
        let result = self.inner.send_checked(
            &MgmtCommand::disconnect(dev_id, address, address_type),
        ).map(drop);

        let synthesized = MgmtEvent::new_device_disconnected(dev_id, address, address_type, reason);
        self.inner.dispatch_callbacks(&synthesized);

        result
    }

    /// Register a callback for one event opcode, optionally device-scoped
    pub fn add_event_callback(
        &self,
        opcode: MgmtEventOpcode,
        dev_id: Option<u16>,
        callback: MgmtEventCallback,
    ) {
        let mut map = self.inner.event_callbacks.lock().unwrap();
        let entry = map.entry(opcode.into()).or_insert_with(|| Arc::new(Vec::new()));

        if entry.iter().any(|e| Arc::ptr_eq(&e.callback, &callback)) {
            return;
        }

        let mut next: Vec<EventCallbackEntry> = entry.iter()
            .map(|e| EventCallbackEntry { dev_id: e.dev_id, callback: e.callback.clone() })
            .collect();
        next.push(EventCallbackEntry { dev_id, callback });
        *entry = Arc::new(next);
    }

    pub fn remove_event_callback(&self, opcode: MgmtEventOpcode, callback: &MgmtEventCallback) {
        let mut map = self.inner.event_callbacks.lock().unwrap();

        if let Some(entry) = map.get_mut(&opcode.into()) {
            let next: Vec<EventCallbackEntry> = entry.iter()
                .filter(|e| !Arc::ptr_eq(&e.callback, callback))
                .map(|e| EventCallbackEntry { dev_id: e.dev_id, callback: e.callback.clone() })
                .collect();
            *entry = Arc::new(next);
        }
    }

    /// Register a device-found callback receiving decoded advertising data
    pub fn add_device_found_callback(&self, callback: DeviceFoundCallback) {
        let mut guard = self.inner.device_found_callbacks.lock().unwrap();

        if guard.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            return;
        }

        let mut next = guard.as_ref().clone();
        next.push(callback);
        *guard = Arc::new(next);
    }

    /// Register an adapter-set callback
    ///
    /// Every adapter currently present is replayed immediately as
    /// `added = true`, so a consumer can be fully event-driven.
    pub fn add_adapter_set_callback(&self, callback: AdapterSetCallback) {
        {
            let mut guard = self.inner.adapter_set_callbacks.lock().unwrap();

            if guard.iter().any(|c| Arc::ptr_eq(c, &callback)) {
                return;
            }

            let mut next = guard.as_ref().clone();
            next.push(callback.clone());
            *guard = Arc::new(next);
        }

        for info in self.inner.adapters_snapshot().iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(true, info)
            }));

            if result.is_err() {
                log::error!("adapter-set callback panicked during replay");
            }
        }
    }

    pub fn remove_adapter_set_callback(&self, callback: &AdapterSetCallback) {
        let mut guard = self.inner.adapter_set_callbacks.lock().unwrap();
        let next: Vec<_> = guard.iter()
            .filter(|c| !Arc::ptr_eq(c, callback))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    /// Shut the dispatcher down
    ///
    /// Idempotent and safe to call from any thread including a callback on
    /// the reader thread. Removes tracked whitelist entries, powers every
    /// adapter down, clears all callbacks, closes the socket and waits for
    /// the reader (unless running on it).
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let on_reader =
            *self.reader_thread_id.lock().unwrap() == Some(thread::current().id());

        // Commands need the reader alive to complete; skip them when the
        // reader itself is closing us.
        if !on_reader && self.inner.channel.is_open() {
            let whitelist: Vec<_> =
                core::mem::replace(&mut *self.inner.whitelist.lock().unwrap(), Vec::new());

            for (dev_id, address, address_type) in whitelist {
                if let Err(e) = self.inner.send_checked_raw(
                    &MgmtCommand::remove_device_whitelist(dev_id, &address, address_type),
                ) {
                    log::debug!("whitelist cleanup for dev {}: {}", dev_id, e);
                }
            }

            for info in self.inner.adapters_snapshot().iter() {
                if let Err(e) = self.inner.send_checked_raw(
                    &MgmtCommand::set_powered(info.dev_id, false),
                ) {
                    log::debug!("power-down of dev {}: {}", info.dev_id, e);
                }
            }
        }

        self.inner.event_callbacks.lock().unwrap().clear();
        *self.inner.adapter_set_callbacks.lock().unwrap() = Arc::new(Vec::new());
        *self.inner.device_found_callbacks.lock().unwrap() = Arc::new(Vec::new());

        self.inner.channel.close();
        self.inner.reply_ring.close();

        if !on_reader {
            if let Some(handle) = self.reader.lock().unwrap().take() {
                handle.join().ok();
            }
        }
    }
}

impl<S: ControlChannel + 'static> Drop for Manager<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open the dispatcher over the kernel control channel
#[cfg(target_os = "linux")]
pub fn open() -> Result<Manager<crate::hci::HciSocket>, Error> {
    let socket = crate::hci::HciSocket::open(
        crate::hci::HCI_DEV_NONE,
        crate::hci::HciChannel::Control,
    )
    .map_err(|e| match e {
        sock::Error::Io(_) => Error::IoError,
        _ => Error::NotConnected,
    })?;

    Manager::new(socket)
}

fn reader_loop<S: ControlChannel + 'static>(inner: Arc<ManagerInner<S>>, poll: Duration) {
    let mut buf = alloc::vec![0u8; READ_BUFFER_SIZE];

    // The loop ends when the channel closes underneath the blocking read;
    // `close` keeps issuing its final commands until then, so the closed
    // flag alone must not stop reply processing.
    loop {
        let n = match inner.channel.read(&mut buf, poll) {
            Ok(n) => n,
            Err(sock::Error::Timeout) | Err(sock::Error::Interrupted) => continue,
            Err(sock::Error::NotConnected) => break,
            Err(sock::Error::Io(errno)) => {
                log::warn!("mgmt read failed, errno {}", errno);
                break;
            }
        };

        let event = match MgmtEvent::parse(Octets::from_slice(&buf[..n])) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("dropping malformed mgmt frame: {}", e);
                continue;
            }
        };

        if inner.debug_event {
            log::debug!("mgmt RX: {}", event);
        }

        match event.opcode() {
            Some(MgmtEventOpcode::CmdComplete) | Some(MgmtEventOpcode::CmdStatus) => {
                let batch = inner.reply_ring.capacity() / 4;

                match inner.reply_ring.put_dropping_oldest(event, batch) {
                    Ok(0) | Err(_) => (),
                    Ok(dropped) => log::warn!(
                        "mgmt reply ring full, dropped {} oldest of {} capacity",
                        dropped,
                        inner.reply_ring.capacity()
                    ),
                }
            }
            Some(MgmtEventOpcode::IndexAdded) => {
                let worker_inner = inner.clone();
                let dev_id = event.dev_id();

                thread::spawn(move || {
                    match worker_inner.initialize_adapter(dev_id) {
                        Ok(info) => worker_inner.fan_adapter_set(true, &info),
                        Err(e) => log::warn!("added adapter {} failed to initialize: {}", dev_id, e),
                    }
                    worker_inner.dispatch_callbacks(&MgmtEvent::new_index_added(dev_id));
                });
            }
            Some(MgmtEventOpcode::IndexRemoved) => {
                let worker_inner = inner.clone();
                let dev_id = event.dev_id();

                thread::spawn(move || {
                    if let Some(info) = worker_inner.take_adapter(dev_id) {
                        worker_inner.fan_adapter_set(false, &info);
                    }
                    worker_inner.dispatch_callbacks(&MgmtEvent::new_index_removed(dev_id));
                });
            }
            _ => inner.dispatch_callbacks(&event),
        }
    }

    inner.reply_ring.close();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mgmt::AdapterSetting;
    use alloc::collections::VecDeque;
    use std::sync::Condvar;
    use std::time::Instant;

    /// Scripted in-memory control channel
    struct MockControl {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        available: Condvar,
        written: Mutex<Vec<Vec<u8>>>,
        responder: Mutex<Option<Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send>>>,
        open: AtomicBool,
    }

    impl MockControl {
        fn with_responder<F>(responder: F) -> Arc<MockControl>
        where F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static
        {
            Arc::new(MockControl {
                inbound: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                written: Mutex::new(Vec::new()),
                responder: Mutex::new(Some(Box::new(responder))),
                open: AtomicBool::new(true),
            })
        }

        fn push_inbound(&self, frame: Vec<u8>) {
            self.inbound.lock().unwrap().push_back(frame);
            self.available.notify_all();
        }
    }

    impl ControlChannel for Arc<MockControl> {
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

    fn adapter_info_param(dev_id: u16) -> Vec<u8> {
        let mut data = alloc::vec![
            dev_id as u8, 0x22, 0x33, 0x44, 0x55, 0x66, // address
            0x08,        // version
            0x0F, 0x00,  // manufacturer
        ];
        data.extend_from_slice(&0x0001_FFFFu32.to_le_bytes()); // supported
        data.extend_from_slice(
            &(AdapterSetting::POWERED | AdapterSetting::LE).bits().to_le_bytes(),
        );
        data.extend_from_slice(&[0, 0, 0]); // dev class
        data.extend_from_slice(b"hci\0");
        data
    }

    /// A kernel with two adapters that accepts everything
    fn kernel_responder(frame: &[u8]) -> Vec<Vec<u8>> {
        let opcode = <u16>::from_le_bytes([frame[0], frame[1]]);
        let dev_id = <u16>::from_le_bytes([frame[2], frame[3]]);

        let data = match opcode {
            0x0001 => alloc::vec![0x01, 0x12, 0x00], // version 1.18
            0x0003 => {
                let mut d = 2u16.to_le_bytes().to_vec();
                d.extend_from_slice(&0u16.to_le_bytes());
                d.extend_from_slice(&1u16.to_le_bytes());
                d
            }
            0x0004 => adapter_info_param(dev_id),
            _ => Vec::new(),
        };

        alloc::vec![MgmtEvent::new_cmd_complete(dev_id, opcode, 0, &data).bytes().to_vec()]
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn startup_enumerates_and_initializes() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let adapters = manager.adapters();

        assert_eq!(2, adapters.len());
        assert_eq!(0, adapters[0].dev_id);
        assert_eq!(1, adapters[1].dev_id);
        assert!(adapters[0].current_settings.contains(AdapterSetting::POWERED));
        assert_eq!("hci", adapters[0].name);

        // The init sequence ended with SET_POWERED followed by READ_INFO
        let written = channel.written.lock().unwrap().clone();
        let opcodes: Vec<u16> = written.iter()
            .map(|f| <u16>::from_le_bytes([f[0], f[1]]))
            .collect();

        assert!(opcodes.windows(2).any(|w| w == [0x0005, 0x0004]));

        manager.close();
    }

    #[test]
    fn adapter_hotplug_replay() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let seen: Arc<Mutex<Vec<(bool, u16)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        manager.add_adapter_set_callback(Arc::new(move |added: bool, info: &AdapterInfo| {
            recorder.lock().unwrap().push((added, info.dev_id));
        }));

        // Present adapters are replayed in order on registration
        assert_eq!(alloc::vec![(true, 0), (true, 1)], seen.lock().unwrap().clone());

        channel.push_inbound(MgmtEvent::new_index_removed(0).bytes().to_vec());
        wait_until(|| seen.lock().unwrap().len() == 3);

        assert_eq!((false, 0), seen.lock().unwrap()[2]);
        assert_eq!(1, manager.adapters().len());

        channel.push_inbound(MgmtEvent::new_index_added(0).bytes().to_vec());
        wait_until(|| seen.lock().unwrap().len() == 4);

        assert_eq!((true, 0), seen.lock().unwrap()[3]);
        assert_eq!(2, manager.adapters().len());

        manager.close();
    }

    #[test]
    fn event_callbacks_filter_by_dev_id() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let seen: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));

        let any_recorder = seen.clone();
        manager.add_event_callback(
            MgmtEventOpcode::NewSettings,
            None,
            Arc::new(move |evt: &MgmtEvent| any_recorder.lock().unwrap().push(evt.dev_id())),
        );

        let scoped = seen.clone();
        manager.add_event_callback(
            MgmtEventOpcode::NewSettings,
            Some(1),
            Arc::new(move |evt: &MgmtEvent| scoped.lock().unwrap().push(100 + evt.dev_id())),
        );

        channel.push_inbound(
            MgmtEvent::new_settings_event(0, AdapterSetting::POWERED).bytes().to_vec(),
        );
        channel.push_inbound(
            MgmtEvent::new_settings_event(1, AdapterSetting::POWERED).bytes().to_vec(),
        );

        wait_until(|| seen.lock().unwrap().len() == 3);

        assert_eq!(alloc::vec![0, 1, 101], seen.lock().unwrap().clone());

        manager.close();
    }

    #[test]
    fn close_is_idempotent_and_stops_callbacks() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let seen: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        manager.add_event_callback(
            MgmtEventOpcode::NewSettings,
            None,
            Arc::new(move |evt: &MgmtEvent| recorder.lock().unwrap().push(evt.dev_id())),
        );

        manager.close();
        manager.close();

        assert!(!channel.is_open());

        // Nothing is dispatched once closed
        channel.push_inbound(
            MgmtEvent::new_settings_event(0, AdapterSetting::POWERED).bytes().to_vec(),
        );
        thread::sleep(Duration::from_millis(50));
        assert!(seen.lock().unwrap().is_empty());

        // The adapters were powered down on the way out
        let written = channel.written.lock().unwrap().clone();
        let powered_off = written.iter()
            .filter(|f| {
                <u16>::from_le_bytes([f[0], f[1]]) == 0x0005 && f[6] == 0x00
            })
            .count();
        assert_eq!(2, powered_off);
    }

    #[test]
    fn device_found_decodes_eir() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let seen: Arc<Mutex<Vec<(u16, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        manager.add_device_found_callback(Arc::new(
            move |dev_id: u16, _addr: &BluetoothDeviceAddress, _type: u8, rssi: i8, report: &EirReport| {
            assert_eq!(-60, rssi);
            recorder.lock().unwrap().push((
                dev_id,
                report.name().unwrap_or("").into(),
            ));
        },
        ));

        let mut param = alloc::vec![0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0x01];
        param.push(0xC4); // rssi -60
        param.extend_from_slice(&0u32.to_le_bytes());
        let eir = [0x05u8, 0x09, b'n', b'o', b'd', b'e'];
        param.extend_from_slice(&(eir.len() as u16).to_le_bytes());
        param.extend_from_slice(&eir);

        let mut frame = 0x0012u16.to_le_bytes().to_vec();
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&(param.len() as u16).to_le_bytes());
        frame.extend_from_slice(&param);

        channel.push_inbound(frame);

        wait_until(|| !seen.lock().unwrap().is_empty());

        assert_eq!(alloc::vec![(0u16, alloc::string::String::from("node"))],
            seen.lock().unwrap().clone());

        manager.close();
    }

    #[test]
    fn synthesized_disconnect_event() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        manager.add_event_callback(
            MgmtEventOpcode::DeviceDisconnected,
            None,
            Arc::new(move |evt: &MgmtEvent| {
                let (_, _, reason) = evt.device_disconnected().unwrap();
                recorder.lock().unwrap().push(reason);
            }),
        );

        manager
            .disconnect_device(0, &[1, 2, 3, 4, 5, 6], 0x01, 0x13)
            .unwrap();

        // Synthesized synchronously by the call itself
        assert_eq!(alloc::vec![0x13u8], seen.lock().unwrap().clone());

        manager.close();
    }

    #[test]
    fn whitelist_tracked_and_cleared_on_close() {
        let channel = MockControl::with_responder(kernel_responder);
        let manager = Manager::new(channel.clone()).unwrap();

        manager.add_device_whitelist(0, &[9, 8, 7, 6, 5, 4], 0x01, 0x02).unwrap();
        manager.close();

        let written = channel.written.lock().unwrap().clone();
        let removed = written.iter().any(|f| {
            <u16>::from_le_bytes([f[0], f[1]]) == 0x0034
                && f[6..12] == [9, 8, 7, 6, 5, 4]
        });

        assert!(removed);
    }
}
