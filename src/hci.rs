//! Raw HCI sockets
//!
//! A datagram socket bound to an adapter index and one of the kernel's HCI
//! channels. The raw and user channels carry Bluetooth Core Spec Vol 4
//! Part E framing as an opaque byte stream; the control channel carries the
//! management protocol of the [`mgmt`](crate::mgmt) module.

use crate::sock::Error;

/// Device id meaning "no adapter", used by the control channel for
/// version and index-list queries
pub const HCI_DEV_NONE: u16 = 0xFFFF;

// Packet indicator bytes, BT Core Spec Vol 4 Part A
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACLDATA_PKT: u8 = 0x02;
pub const HCI_SCODATA_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

/// The kernel HCI socket channels
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum HciChannel {
    /// Filtered access alongside the kernel's own host stack
    Raw,
    /// Exclusive user-space control of the adapter
    User,
    Monitor,
    /// The management protocol channel
    Control,
}

impl From<HciChannel> for u16 {
    fn from(c: HciChannel) -> u16 {
        match c {
            HciChannel::Raw => 0,
            HciChannel::User => 1,
            HciChannel::Monitor => 2,
            HciChannel::Control => 3,
        }
    }
}

/// An HCI socket filter
///
/// The kernel applies the filter to a raw channel socket; only packet types
/// and events with their bit set are delivered. Composed with the builder
/// methods and installed with [`HciSocket::set_filter`].
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    pub fn new() -> Self {
        HciFilter::default()
    }

    /// Pass packets with the given indicator byte
    pub fn with_packet_type(mut self, packet_type: u8) -> Self {
        self.type_mask |= 1 << (packet_type as u32 & 31);
        self
    }

    /// Pass the given event code
    pub fn with_event(mut self, event: u8) -> Self {
        let bit = event as u32 & 63;
        self.event_mask[(bit >> 5) as usize] |= 1 << (bit & 31);
        self
    }

    /// Restrict command-complete style events to one opcode
    pub fn with_opcode(mut self, opcode: u16) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn type_mask(&self) -> u32 { self.type_mask }

    pub fn event_mask(&self) -> [u32; 2] { self.event_mask }

    pub fn opcode(&self) -> u16 { self.opcode }
}

#[cfg(target_os = "linux")]
pub use self::linux::HciSocket;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::sock::{last_errno, ArcFileDesc, PollOutcome, Wake, poll_read};
    use nix::libc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SOL_HCI: libc::c_int = 0;
    const HCI_FILTER: libc::c_int = 2;
    const BTPROTO_HCI: libc::c_int = 1;

    #[repr(C)]
    #[derive(Default)]
    struct sockaddr_hci {
        hci_family: libc::sa_family_t,
        hci_dev: u16,
        hci_channel: u16,
    }

    #[repr(C)]
    #[derive(Default)]
    struct hci_filter {
        type_mask: u32,
        event_mask: [u32; 2],
        opcode: u16,
    }

    /// A raw kernel HCI socket
    ///
    /// Writes are serialized by one mutex so command frames stay atomic and
    /// ordered. A pending read is unblocked by `close` through the eventfd
    /// merged into the poll set.
    #[derive(Debug)]
    pub struct HciSocket {
        fd: ArcFileDesc,
        wake: Wake,
        write_mtx: Mutex<()>,
        open: AtomicBool,
        dev_id: u16,
        channel: HciChannel,
    }

    impl HciSocket {
        /// Open and bind a socket to `dev_id` on the given channel
        ///
        /// Use [`HCI_DEV_NONE`] with [`HciChannel::Control`] for the
        /// management channel.
        pub fn open(dev_id: u16, channel: HciChannel) -> Result<HciSocket, Error> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_BLUETOOTH,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    BTPROTO_HCI,
                )
            };

            if fd < 0 {
                return Err(Error::Io(last_errno()));
            }

            let fd = ArcFileDesc::from(fd);

            let sa = sockaddr_hci {
                hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                hci_dev: dev_id,
                hci_channel: channel.into(),
            };

            let rc = unsafe {
                libc::bind(
                    fd.raw_fd(),
                    &sa as *const sockaddr_hci as *const libc::sockaddr,
                    core::mem::size_of::<sockaddr_hci>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                return Err(Error::Io(last_errno()));
            }

            Ok(HciSocket {
                fd,
                wake: Wake::new()?,
                write_mtx: Mutex::new(()),
                open: AtomicBool::new(true),
                dev_id,
                channel,
            })
        }

        pub fn dev_id(&self) -> u16 { self.dev_id }

        pub fn channel(&self) -> HciChannel { self.channel }

        /// Install a packet filter on a raw channel socket
        pub fn set_filter(&self, filter: &HciFilter) -> Result<(), Error> {
            let raw = hci_filter {
                type_mask: filter.type_mask(),
                event_mask: filter.event_mask(),
                opcode: filter.opcode(),
            };

            let rc = unsafe {
                libc::setsockopt(
                    self.fd.raw_fd(),
                    SOL_HCI,
                    HCI_FILTER,
                    &raw as *const hci_filter as *const libc::c_void,
                    core::mem::size_of::<hci_filter>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                Err(Error::Io(last_errno()))
            } else {
                Ok(())
            }
        }

        pub fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        /// Read one packet, blocking up to `timeout`
        pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
            loop {
                if !self.is_open() {
                    return Err(Error::NotConnected);
                }

                match poll_read(self.fd.raw_fd(), &self.wake, timeout)? {
                    PollOutcome::Woken => return Err(Error::NotConnected),
                    PollOutcome::Readable => (),
                }

                let n = unsafe {
                    libc::read(
                        self.fd.raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };

                if n < 0 {
                    let errno = last_errno();
                    if errno == libc::EINTR || errno == libc::EAGAIN {
                        continue;
                    }
                    return Err(Error::Io(errno));
                }
                if n == 0 {
                    return Err(Error::NotConnected);
                }

                return Ok(n as usize);
            }
        }

        /// Write one packet
        pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
            let _guard = self.write_mtx.lock().unwrap();

            if !self.is_open() {
                return Err(Error::NotConnected);
            }

            loop {
                let n = unsafe {
                    libc::write(
                        self.fd.raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };

                if n < 0 {
                    let errno = last_errno();
                    if errno == libc::EINTR {
                        continue;
                    }
                    return Err(Error::Io(errno));
                }

                return Ok(n as usize);
            }
        }

        /// Close the socket
        ///
        /// Idempotent; a blocked reader wakes and fails with
        /// [`Error::NotConnected`].
        pub fn close(&self) {
            if self.open.swap(false, Ordering::SeqCst) {
                self.wake.notify();
            }
        }
    }

    impl Drop for HciSocket {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_bit_composition() {
        let filter = HciFilter::new()
            .with_packet_type(HCI_EVENT_PKT)
            .with_event(0x0E) // Command Complete
            .with_event(0x3E) // LE Meta
            .with_opcode(0x0C03);

        assert_eq!(1 << 4, filter.type_mask());
        assert_eq!(1 << 0x0E, filter.event_mask()[0]);
        assert_eq!(1 << (0x3E - 32), filter.event_mask()[1]);
        assert_eq!(0x0C03, filter.opcode());
    }

    #[test]
    fn channel_values() {
        assert_eq!(0u16, HciChannel::Raw.into());
        assert_eq!(1u16, HciChannel::User.into());
        assert_eq!(3u16, HciChannel::Control.into());
    }
}
