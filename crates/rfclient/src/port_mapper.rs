//! C8: port-map heartbeats (spec section 4.8). Every `PORT_MAP_INTERVAL`,
//! sends one magic raw-ethernet frame out each physical interface that is
//! not yet active, so the central server can discover which physical
//! data-plane port corresponds to which virtual port.
//!
//! Ported from the original's `PortMapper::send_packet` (`PortMapper.cc`):
//! same socket(PF_PACKET)/ioctl(SIOCGIFFLAGS)/bind/sendto sequence, done
//! here with `libc` directly rather than a netlink-rs wrapper since this
//! is a one-shot raw-socket send, not a netlink exchange.

use crate::interfaces::InterfaceRegistry;
use std::time::Duration;
use tracing::{debug, warn};

/// Matches the original's `SLEEP_TIME` (`PortMapper.cc`).
pub const PORT_MAP_INTERVAL: Duration = Duration::from_secs(10);

/// `RF_ETH_PROTO` from the original's `defs.h`: the magic ethertype the
/// central server recognizes as a port-mapping frame.
const RF_ETH_PROTO: u16 = 0x0A0A;
/// 2 * MAC (12) + ethertype (2) + vm_id (8) + port (1), matching the
/// original's `BUFFER_SIZE`.
const FRAME_LEN: usize = 23;

/// Builds the 23-byte port-map frame for `vm_id`/`port` (spec section
/// 4.8): zero dst MAC, `src_mac` as the source, `RF_ETH_PROTO`
/// ethertype, then `vm_id` little-endian and the port number.
fn build_frame(src_mac: &sonic_types::MacAddress, vm_id: u64, port: u32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[6..12].copy_from_slice(src_mac.as_bytes());
    frame[12..14].copy_from_slice(&RF_ETH_PROTO.to_be_bytes());
    frame[14..22].copy_from_slice(&vm_id.to_le_bytes());
    frame[22] = port as u8;
    frame
}

#[cfg(target_os = "linux")]
mod linux_send {
    use super::*;
    use std::io;
    use std::os::unix::io::RawFd;

    fn ioctl_flags(fd: RawFd, name: &str) -> io::Result<libc::c_short> {
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        let bytes = name.as_bytes();
        if bytes.len() >= req.ifr_name.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
        }
        for (dst, &b) in req.ifr_name.iter_mut().zip(bytes) {
            *dst = b as libc::c_char;
        }
        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { req.ifr_ifru.ifru_flags })
    }

    /// Sends one port-map frame out `name`, skipping (not erroring) if
    /// the interface is administratively down (`IFF_UP` clear), matching
    /// the original's `send_packet` early-return.
    pub fn send_port_map(name: &str, frame: &[u8; FRAME_LEN]) -> io::Result<bool> {
        let ifindex = nix::net::if_::if_nametoindex(name)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;

        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (RF_ETH_PROTO as u16).to_be() as i32) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let result = (|| {
            let flags = ioctl_flags(fd, name)?;
            if flags as i32 & libc::IFF_UP == 0 {
                return Ok(false);
            }

            let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_ifindex = ifindex as i32;
            sll.sll_protocol = (RF_ETH_PROTO as u16).to_be();

            let ret = unsafe {
                libc::bind(
                    fd,
                    &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            let sent = unsafe {
                libc::sendto(
                    fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                    &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if sent < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(true)
        })();
        unsafe { libc::close(fd) };
        result
    }
}

#[cfg(not(target_os = "linux"))]
mod linux_send {
    use super::*;
    use std::io;

    pub fn send_port_map(_name: &str, _frame: &[u8; FRAME_LEN]) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "raw AF_PACKET sends require Linux"))
    }
}

/// One heartbeat pass over every physical, inactive interface (spec
/// section 4.8). Split out from [`run_port_mapper`] so tests can drive a
/// single pass without a real 10-second sleep.
fn heartbeat_once(interfaces: &InterfaceRegistry, vm_id: u64) {
    for iface in interfaces.all() {
        if !iface.physical || iface.active {
            continue;
        }
        let frame = build_frame(&iface.hw_addr, vm_id, iface.port);
        match tokio::task::block_in_place(|| linux_send::send_port_map(&iface.name, &frame)) {
            Ok(true) => debug!(interface = %iface.name, "mapping packet sent"),
            Ok(false) => debug!(interface = %iface.name, "interface administratively down, skipping"),
            Err(e) => warn!(interface = %iface.name, error = %e, "error sending mapping packet"),
        }
    }
}

/// Runs forever, sending a port-map heartbeat every [`PORT_MAP_INTERVAL`].
pub async fn run_port_mapper(interfaces: InterfaceRegistry, vm_id: u64) {
    loop {
        heartbeat_once(&interfaces, vm_id);
        tokio::time::sleep(PORT_MAP_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_spec() {
        let mac: sonic_types::MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let frame = build_frame(&mac, 0x0102030405, 7);
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[0..6], &[0, 0, 0, 0, 0, 0]);
        assert_eq!(&frame[6..12], mac.as_bytes());
        assert_eq!(&frame[12..14], &RF_ETH_PROTO.to_be_bytes());
        assert_eq!(&frame[14..22], &0x0102030405u64.to_le_bytes());
        assert_eq!(frame[22], 7);
    }

    #[test]
    fn active_interfaces_are_never_probed() {
        let registry = InterfaceRegistry::new();
        registry.insert(crate::types::Interface {
            port: 1,
            name: "swp1".into(),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan: None,
            ip_list: vec![],
            active: true,
            physical: true,
        });
        // heartbeat_once would attempt a raw socket for swp1 if it were
        // considered -- since it is active, `all()` must still list it
        // but the filter in heartbeat_once skips it before any syscall.
        assert!(registry.lookup("swp1").unwrap().active);
    }
}
