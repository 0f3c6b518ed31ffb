//! Raw link-layer frames bound to one interface and one ethertype.
//!
//! Only Linux `AF_PACKET` sockets are supported. Other platforms get a transport that
//! refuses to open, see [`super::capabilities`].

use std::time::Duration;

use super::{MacAddr, ResourceList, Transport, TransportError};

#[cfg(target_os = "linux")]
pub const SUPPORTED: bool = true;
#[cfg(not(target_os = "linux"))]
pub const SUPPORTED: bool = false;

pub struct RawLink {
    sock: imp::Socket,
    ifname: String,
}

impl RawLink {
    pub fn open(ifname: &str, ethertype: u16) -> Result<Self, TransportError> {
        if ifname.is_empty() {
            return Err(TransportError::Connection("empty interface name".into()));
        }
        let sock = imp::Socket::open(ifname, ethertype)?;
        log::info!(
            "[link] bound {} ethertype=0x{:04x} local={}",
            ifname,
            ethertype,
            sock.hw_addr()
        );
        Ok(Self {
            sock,
            ifname: ifname.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.ifname
    }

    /// Network interfaces that could carry raw frames. Needs no open socket.
    pub fn list_resources() -> ResourceList {
        imp::interfaces()
    }
}

impl Transport for RawLink {
    fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.sock.send(buf)
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.sock.recv(max_len, timeout)
    }

    fn close(&mut self) {
        log::info!("[link] closing {}", self.ifname);
    }

    fn local_hw_addr(&self) -> Option<MacAddr> {
        Some(self.sock.hw_addr())
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::ffi::{CStr, CString};
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    use super::super::{MacAddr, ResourceList, TransportError};

    pub struct Socket {
        fd: OwnedFd,
        hw: MacAddr,
    }

    impl Socket {
        pub fn open(ifname: &str, ethertype: u16) -> Result<Self, TransportError> {
            if ifname.len() >= libc::IFNAMSIZ {
                return Err(TransportError::Connection(format!(
                    "interface name too long: {ifname}"
                )));
            }
            let cname = CString::new(ifname).map_err(|_| {
                TransportError::Connection(format!("bad interface name {ifname:?}"))
            })?;
            let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
            if ifindex == 0 {
                return Err(TransportError::Connection(format!(
                    "no such interface: {ifname}"
                )));
            }

            let proto = ethertype.to_be();
            let raw =
                unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto as libc::c_int) };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = proto;
            addr.sll_ifindex = ifindex as libc::c_int;
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let hw = hw_addr(&fd, &cname)?;
            Ok(Self { fd, hw })
        }

        pub fn hw_addr(&self) -> MacAddr {
            self.hw
        }

        pub fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        pub fn recv(
            &mut self,
            max_len: usize,
            timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if rc == 0 {
                return Err(TransportError::TimedOut);
            }

            let mut buf = vec![0u8; max_len];
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            buf.truncate(n as usize);
            Ok(buf)
        }
    }

    fn hw_addr(fd: &OwnedFd, name: &CStr) -> Result<MacAddr, TransportError> {
        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as libc::c_char;
        }
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                libc::SIOCGIFHWADDR as _,
                &mut req as *mut libc::ifreq,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
        let mut mac = [0u8; 6];
        for (m, d) in mac.iter_mut().zip(data.iter()) {
            *m = *d as u8;
        }
        Ok(MacAddr(mac))
    }

    pub fn interfaces() -> ResourceList {
        let mut out = ResourceList::new();
        let head = unsafe { libc::if_nameindex() };
        if head.is_null() {
            return out;
        }
        unsafe {
            let mut cur = head;
            while (*cur).if_index != 0 && !(*cur).if_name.is_null() {
                let name = CStr::from_ptr((*cur).if_name).to_string_lossy().into_owned();
                let desc = format!("{} (ifindex {})", name, (*cur).if_index);
                out.insert(name, desc);
                cur = cur.add(1);
            }
            libc::if_freenameindex(head);
        }
        out
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::time::Duration;

    use super::super::{MacAddr, ResourceList, TransportError};

    pub enum Socket {}

    impl Socket {
        pub fn open(_ifname: &str, _ethertype: u16) -> Result<Self, TransportError> {
            Err(TransportError::Unsupported(
                "raw link-layer frames need Linux AF_PACKET",
            ))
        }

        pub fn hw_addr(&self) -> MacAddr {
            match *self {}
        }

        pub fn send(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
            match *self {}
        }

        pub fn recv(
            &mut self,
            _max_len: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            match *self {}
        }
    }

    pub fn interfaces() -> ResourceList {
        ResourceList::new()
    }
}
