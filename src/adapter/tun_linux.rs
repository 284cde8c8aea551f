//! Linux TUN/TAP device.

use async_trait::async_trait;
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use libc::{
    c_char, c_int, c_short, c_void, close, ioctl, open, socket, AF_INET, IFF_NO_PI, IFF_TAP,
    IFF_TUN, O_CLOEXEC, O_NONBLOCK, O_RDWR, SOCK_DGRAM,
};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{Device, DeviceConfig, DeviceFactory, DeviceKind};
use crate::error::{Error, Result};

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// SIOCSIFFLAGS - Set interface flags.
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

/// SIOCGIFFLAGS - Get interface flags.
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;

/// SIOCSIFMTU - Set interface MTU.
const SIOCSIFMTU: libc::c_ulong = 0x8922;

const IFF_UP: c_short = 0x1;
const IFF_RUNNING: c_short = 0x40;

/// Interface request structure.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; 16],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// Interface request with MTU.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; 16],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

/// A kernel TUN or TAP interface driven through `/dev/net/tun`.
pub struct KernelTap {
    fd: AsyncFd<OwnedFd>,
    name: String,
    kind: DeviceKind,
    closed: watch::Sender<bool>,
}

impl KernelTap {
    /// Create the interface, set its MTU and bring it up.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let flags = match config.kind {
            DeviceKind::Tun => IFF_TUN,
            DeviceKind::Tap => IFF_TAP,
        } | IFF_NO_PI;

        let (fd, name) = unsafe {
            let fd = open(
                b"/dev/net/tun\0".as_ptr() as *const c_char,
                O_RDWR | O_NONBLOCK | O_CLOEXEC,
            );
            if fd < 0 {
                return Err(Error::device(format!(
                    "open /dev/net/tun: {}",
                    io::Error::last_os_error()
                )));
            }

            let mut ifr = IfReq {
                ifr_name: [0; 16],
                ifr_flags: flags as c_short,
                _pad: [0; 22],
            };
            copy_name(&config.name, &mut ifr.ifr_name);

            if ioctl(fd, TUNSETIFF, &mut ifr as *mut _ as *mut c_void) < 0 {
                let err = io::Error::last_os_error();
                close(fd);
                return Err(Error::device(format!("TUNSETIFF {}: {}", config.name, err)));
            }

            let name = CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            (OwnedFd::from_raw_fd(fd), name)
        };

        if config.mtu > 0 {
            set_mtu(&name, config.mtu)?;
        }
        set_up(&name)?;

        info!(device = %name, kind = %config.kind, mtu = config.mtu, "Created kernel device");
        let (closed, _) = watch::channel(false);
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name,
            kind: config.kind,
            closed,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::device(format!("{} is closed", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Device for KernelTap {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        self.ensure_open()?;
        loop {
            let mut guard = tokio::select! {
                guard = self.fd.readable() => guard?,
                _ = closed.changed() => return Err(Error::device(format!("{} is closed", self.name))),
            };
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.get_ref().as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(n) => return Ok(n?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        loop {
            let mut guard = self.fd.writable().await?;
            let res = guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.get_ref().as_raw_fd(), buf.as_ptr() as *const c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(n) => return Ok(n?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(device = %self.name, "Closing kernel device");
        }
    }
}

/// Opens [`KernelTap`] devices.
#[derive(Debug, Default)]
pub struct KernelFactory;

impl DeviceFactory for KernelFactory {
    fn open(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(KernelTap::open(config)?))
    }
}

fn copy_name(name: &str, buf: &mut [c_char; 16]) {
    for (i, byte) in name.bytes().take(15).enumerate() {
        buf[i] = byte as c_char;
    }
}

/// Control socket for interface ioctls.
struct ControlSocket(RawFd);

impl ControlSocket {
    fn new() -> Result<Self> {
        let fd = unsafe { socket(AF_INET, SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self(fd))
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        if unsafe { ioctl(self.0, request, arg as *mut T as *mut c_void) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe {
            close(self.0);
        }
    }
}

fn set_mtu(name: &str, mtu: u16) -> Result<()> {
    let sock = ControlSocket::new()?;
    let mut ifr = IfReqMtu {
        ifr_name: [0; 16],
        ifr_mtu: mtu as c_int,
        _pad: [0; 20],
    };
    copy_name(name, &mut ifr.ifr_name);
    sock.ioctl(SIOCSIFMTU, &mut ifr)
        .map_err(|e| Error::device(format!("set mtu {} on {}: {}", mtu, name, e)))?;
    debug!(device = %name, mtu, "Set MTU");
    Ok(())
}

fn set_up(name: &str) -> Result<()> {
    let sock = ControlSocket::new()?;
    let mut ifr = IfReq {
        ifr_name: [0; 16],
        ifr_flags: 0,
        _pad: [0; 22],
    };
    copy_name(name, &mut ifr.ifr_name);
    sock.ioctl(SIOCGIFFLAGS, &mut ifr)
        .map_err(|e| Error::device(format!("get flags of {}: {}", name, e)))?;

    ifr.ifr_flags |= IFF_UP | IFF_RUNNING;
    sock.ioctl(SIOCSIFFLAGS, &mut ifr)
        .map_err(|e| Error::device(format!("bring up {}: {}", name, e)))?;
    Ok(())
}
