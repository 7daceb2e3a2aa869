//! Linux TUN interface

use super::{Device, DeviceKind, Lifecycle};
use crate::packet::Packet;
use crate::{Error, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, RwLock};
use tokio::io::unix::AsyncFd;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

const CLONE_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Interface parameters applied on start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunSettings {
    pub name: String,
    /// Interface address and prefix length
    pub address: Option<(Ipv4Addr, u8)>,
    pub mtu: u32,
}

/// TUN interface exchanging raw IP packets (no packet-info header)
pub struct TunDevice {
    settings: TunSettings,
    name: String,
    lifecycle: Lifecycle,
    fd: RwLock<Option<Arc<AsyncFd<OwnedFd>>>>,
}

impl TunDevice {
    pub fn new(settings: TunSettings) -> Self {
        Self {
            name: format!("tun://{}", settings.name),
            settings,
            lifecycle: Lifecycle::new(),
            fd: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &TunSettings {
        &self.settings
    }

    fn running_fd(&self) -> Result<Arc<AsyncFd<OwnedFd>>> {
        self.lifecycle.ensure_running(&self.name)?;
        self.fd
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| Error::NotRunning {
                name: self.name.clone(),
            })
    }

    fn device_error(&self, what: &str, err: std::io::Error) -> Error {
        Error::Device {
            name: self.name.clone(),
            reason: format!("{}: {}", what, err),
        }
    }

    /// Open the clone device and attach it to a new TUN interface.
    fn open(&self) -> Result<AsyncFd<OwnedFd>> {
        let fd = self.create()?;
        // Dropping `fd` on a configure error removes the interface again
        self.configure()?;
        AsyncFd::new(fd).map_err(Error::Io)
    }

    fn create(&self) -> Result<OwnedFd> {
        let path = CString::new(CLONE_DEVICE).map_err(|e| Error::Device {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let raw = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(self.device_error(
                "failed to open /dev/net/tun",
                std::io::Error::last_os_error(),
            ));
        }
        // From here on the fd is closed on every early return
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = ifreq_for(&self.settings.name)?;
        ifr.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if ret < 0 {
            return Err(self.device_error("TUNSETIFF failed", std::io::Error::last_os_error()));
        }

        Ok(fd)
    }

    /// Assign address, MTU and bring the link up.
    fn configure(&self) -> Result<()> {
        let ctl = control_socket().map_err(|e| self.device_error("control socket", e))?;
        let name = &self.settings.name;

        if let Some((addr, prefix_len)) = self.settings.address {
            set_ipv4(&ctl, name, libc::SIOCSIFADDR, addr)
                .map_err(|e| self.device_error("failed to set address", e))?;
            set_ipv4(&ctl, name, libc::SIOCSIFNETMASK, prefix_to_netmask(prefix_len))
                .map_err(|e| self.device_error("failed to set netmask", e))?;
        }

        let mut ifr = ifreq_for(name)?;
        ifr.ifr_ifru.ifru_mtu = self.settings.mtu as libc::c_int;
        ioctl(&ctl, libc::SIOCSIFMTU, &mut ifr)
            .map_err(|e| self.device_error("failed to set MTU", e))?;

        let mut ifr = ifreq_for(name)?;
        ioctl(&ctl, libc::SIOCGIFFLAGS, &mut ifr)
            .map_err(|e| self.device_error("failed to read flags", e))?;
        unsafe {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        ioctl(&ctl, libc::SIOCSIFFLAGS, &mut ifr)
            .map_err(|e| self.device_error("failed to bring link up", e))?;

        Ok(())
    }
}

#[async_trait]
impl Device for TunDevice {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start(&self.name)?;

        let async_fd = match self.open() {
            Ok(fd) => fd,
            Err(e) => {
                self.lifecycle.abort_start();
                return Err(e);
            }
        };

        if let Ok(mut guard) = self.fd.write() {
            *guard = Some(Arc::new(async_fd));
        }
        if !self.lifecycle.set_running() {
            self.fd.write().ok().and_then(|mut guard| guard.take());
            return Err(Error::NotRunning {
                name: self.name.clone(),
            });
        }
        info!(
            "Interface {} up (address={:?}, mtu={})",
            self.settings.name, self.settings.address, self.settings.mtu
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let fd = self.fd.write().ok().and_then(|mut guard| guard.take());
        if fd.is_some() {
            debug!("Tearing down {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Local
    }

    async fn read(&self, pkt: &mut Packet, deadline: Instant) -> Result<usize> {
        let fd = self.running_fd()?;
        let buf = pkt.buffer_mut();
        let result = timeout_at(deadline, async {
            loop {
                let mut guard = fd.readable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        })
        .await;

        match result {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_elapsed) => Ok(0),
        }
    }

    async fn write(&self, pkt: &Packet, deadline: Instant) -> Result<usize> {
        let fd = self.running_fd()?;
        let buf = pkt.as_bytes();
        let result = timeout_at(deadline, async {
            loop {
                let mut guard = fd.writable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            buf.as_ptr() as *const libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        })
        .await;

        match result {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_elapsed) => Ok(0),
        }
    }
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    let name_c = CString::new(name).map_err(|_| Error::InvalidInterfaceName {
        name: name.to_string(),
    })?;
    let bytes = name_c.as_bytes_with_nul();

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    if bytes.len() > ifr.ifr_name.len() {
        return Err(Error::InvalidInterfaceName {
            name: name.to_string(),
        });
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn control_socket() -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl(fd: &OwnedFd, request: libc::c_ulong, ifr: &mut libc::ifreq) -> std::io::Result<()> {
    let raw: RawFd = fd.as_raw_fd();
    let ret = unsafe { libc::ioctl(raw, request as _, ifr as *mut libc::ifreq) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_ipv4(
    fd: &OwnedFd,
    name: &str,
    request: libc::c_ulong,
    addr: Ipv4Addr,
) -> std::io::Result<()> {
    let mut ifr = ifreq_for(name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };
    unsafe {
        std::ptr::write(
            &mut ifr.ifr_ifru.ifru_addr as *mut libc::sockaddr as *mut libc::sockaddr_in,
            sin,
        );
    }
    ioctl(fd, request, &mut ifr)
}

fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(!0u32 << (32 - prefix_len.min(32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TunSettings {
        TunSettings {
            name: "uproxy-test".to_string(),
            address: Some((Ipv4Addr::new(10, 99, 0, 1), 24)),
            mtu: 1400,
        }
    }

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_ifreq_name() {
        let ifr = ifreq_for("tun0").unwrap();
        assert_eq!(ifr.ifr_name[0] as u8, b't');
        assert_eq!(ifr.ifr_name[3] as u8, b'0');
        assert_eq!(ifr.ifr_name[4], 0);

        assert!(ifreq_for("an-interface-name-too-long").is_err());
        assert!(ifreq_for("bad\0name").is_err());
    }

    #[test]
    fn test_name_has_scheme() {
        assert_eq!(TunDevice::new(settings()).name(), "tun://uproxy-test");
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let dev = TunDevice::new(settings());
        assert!(dev.stop().await.is_ok());
        assert!(dev.stop().await.is_ok());

        let mut pkt = Packet::with_capacity(64);
        assert!(matches!(
            dev.read(&mut pkt, Instant::now()).await,
            Err(Error::NotRunning { .. })
        ));
    }

    #[tokio::test]
    #[ignore] // Requires CAP_NET_ADMIN and /dev/net/tun
    async fn test_create_interface() {
        let dev = TunDevice::new(settings());
        dev.start().await.expect("failed to create TUN interface");
        assert!(std::path::Path::new("/sys/class/net/uproxy-test").exists());

        dev.stop().await.unwrap();
        dev.stop().await.unwrap();
    }
}
