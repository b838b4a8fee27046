//! L2CAP transport
//!
//! The GATT handler runs over one connection-oriented L2CAP channel per
//! device, CID 0x0004 for the LE Attribute Protocol. The [`L2capChannel`]
//! trait is the seam the handler is written against; [`L2capSocket`] is the
//! kernel implementation, and the handler tests drive in-memory channels
//! through the same trait.

use std::time::Duration;

pub use crate::sock::Error;

/// Fixed channel identifier of the Attribute Protocol on LE links
pub const CID_ATT: u16 = crate::att::L2CAP_ATT_CID;

/// Fixed channel identifier of the LE signaling channel
pub const CID_LE_SIGNALING: u16 = 0x0005;

/// Fixed channel identifier of the Security Manager Protocol
pub const CID_SMP: u16 = 0x0006;

/// Bluetooth address types as used by the kernel socket layer
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum AddressType {
    BrEdr,
    LePublic,
    LeRandom,
}

impl From<AddressType> for u8 {
    fn from(t: AddressType) -> u8 {
        match t {
            AddressType::BrEdr => 0x00,
            AddressType::LePublic => 0x01,
            AddressType::LeRandom => 0x02,
        }
    }
}

/// A byte-stream L2CAP channel
///
/// One mutex serializes concurrent writers; reads are single-reader. After
/// `close` both directions fail with [`Error::NotConnected`], and a reader
/// blocked in `read` wakes up and fails the same way.
pub trait L2capChannel: Send + Sync {
    /// Read one SDU, blocking up to `timeout`
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Write one SDU
    fn write(&self, data: &[u8]) -> Result<usize, Error>;

    /// Close the channel; idempotent
    fn close(&self);

    fn is_open(&self) -> bool;
}

#[cfg(target_os = "linux")]
pub use self::linux::L2capSocket;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::sock::{last_errno, ArcFileDesc, PollOutcome, Wake, poll_read};
    use crate::BluetoothDeviceAddress;
    use nix::libc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BTPROTO_L2CAP: libc::c_int = 0;

    #[repr(C)]
    struct sockaddr_l2 {
        l2_family: libc::sa_family_t,
        l2_psm: u16,
        l2_bdaddr: [u8; 6],
        l2_cid: u16,
        l2_bdaddr_type: u8,
    }

    /// A connection-oriented L2CAP socket
    ///
    /// Bound to the local adapter address, connected to the remote device,
    /// on a fixed channel id. Closing wakes a blocked reader through the
    /// eventfd in the poll set.
    pub struct L2capSocket {
        fd: ArcFileDesc,
        wake: Wake,
        write_mtx: Mutex<()>,
        open: AtomicBool,
        interrupted: Mutex<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
    }

    impl L2capSocket {
        /// Open, bind and connect an ATT bearer to `remote`
        pub fn connect(
            local: &BluetoothDeviceAddress,
            local_type: AddressType,
            remote: &BluetoothDeviceAddress,
            remote_type: AddressType,
            cid: u16,
        ) -> Result<L2capSocket, Error> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_BLUETOOTH,
                    libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                    BTPROTO_L2CAP,
                )
            };

            if fd < 0 {
                return Err(Error::Io(last_errno()));
            }

            let fd = ArcFileDesc::from(fd);

            let local_sa = sockaddr_l2 {
                l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                l2_psm: 0,
                l2_bdaddr: *local,
                l2_cid: cid.to_le(),
                l2_bdaddr_type: local_type.into(),
            };

            let rc = unsafe {
                libc::bind(
                    fd.raw_fd(),
                    &local_sa as *const sockaddr_l2 as *const libc::sockaddr,
                    core::mem::size_of::<sockaddr_l2>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                return Err(Error::Io(last_errno()));
            }

            let remote_sa = sockaddr_l2 {
                l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                l2_psm: 0,
                l2_bdaddr: *remote,
                l2_cid: cid.to_le(),
                l2_bdaddr_type: remote_type.into(),
            };

            let rc = unsafe {
                libc::connect(
                    fd.raw_fd(),
                    &remote_sa as *const sockaddr_l2 as *const libc::sockaddr,
                    core::mem::size_of::<sockaddr_l2>() as libc::socklen_t,
                )
            };

            if rc < 0 {
                return Err(Error::Io(last_errno()));
            }

            Ok(L2capSocket {
                fd,
                wake: Wake::new()?,
                write_mtx: Mutex::new(()),
                open: AtomicBool::new(true),
                interrupted: Mutex::new(None),
            })
        }

        /// Install a query consulted between blocking attempts
        ///
        /// When the query returns true, the pending read fails with
        /// [`Error::Interrupted`].
        pub fn set_interrupted_query(&self, query: Box<dyn Fn() -> bool + Send + Sync>) {
            *self.interrupted.lock().unwrap() = Some(query);
        }

        fn query_interrupted(&self) -> bool {
            match &*self.interrupted.lock().unwrap() {
                Some(query) => query(),
                None => false,
            }
        }
    }

    impl L2capChannel for L2capSocket {
        fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
            loop {
                if !self.is_open() {
                    return Err(Error::NotConnected);
                }
                if self.query_interrupted() {
                    return Err(Error::Interrupted);
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

        fn write(&self, data: &[u8]) -> Result<usize, Error> {
            let _guard = self.write_mtx.lock().unwrap();

            if !self.is_open() {
                return Err(Error::NotConnected);
            }

            loop {
                let n = unsafe {
                    libc::send(
                        self.fd.raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
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

        fn close(&self) {
            if self.open.swap(false, Ordering::SeqCst) {
                self.wake.notify();
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    impl Drop for L2capSocket {
        fn drop(&mut self) {
            self.close();
        }
    }
}
