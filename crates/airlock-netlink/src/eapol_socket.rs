//! PF_PACKET socket bound to the EAPoL ethertype on one interface.
//!
//! Carries the 4-Way Handshake when the driver does not offer control
//! port over netlink. Non-blocking; the owning loop polls the fd.

use std::io;
use std::os::unix::io::RawFd;

use crate::{NetlinkError, Result};

pub const ETHERTYPE_EAPOL: u16 = 0x888e;
const ETHER_HDR_LEN: usize = 14;

pub struct EapolSocket {
    fd: RawFd,
    ifindex: u32,
    own_addr: [u8; 6],
}

/// A received EAPoL PDU with its source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapolPdu {
    pub source: [u8; 6],
    pub pdu: Vec<u8>,
}

impl EapolSocket {
    pub fn open(ifindex: u32, own_addr: [u8; 6]) -> Result<EapolSocket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                (ETHERTYPE_EAPOL).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(NetlinkError::io("EAPoL socket", io::Error::last_os_error()));
        }

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETHERTYPE_EAPOL.to_be();
        sll.sll_ifindex = ifindex as i32;

        let rc = unsafe {
            libc::bind(
                fd,
                &sll as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetlinkError::io("EAPoL bind", err));
        }

        Ok(EapolSocket { fd, ifindex, own_addr })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Sends one EAPoL PDU to `dest`, prepending the Ethernet header.
    pub fn send(&self, dest: [u8; 6], pdu: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(ETHER_HDR_LEN + pdu.len());
        frame.extend_from_slice(&dest);
        frame.extend_from_slice(&self.own_addr);
        frame.extend_from_slice(&ETHERTYPE_EAPOL.to_be_bytes());
        frame.extend_from_slice(pdu);

        let sent =
            unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if sent < 0 {
            return Err(NetlinkError::io("EAPoL send", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receives one PDU if available. `Ok(None)` when the socket would
    /// block.
    pub fn recv(&self) -> Result<Option<EapolPdu>> {
        let mut buf = [0u8; 2304];
        let received =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if received < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(NetlinkError::io("EAPoL recv", err));
        }
        let received = received as usize;
        if received < ETHER_HDR_LEN {
            return Ok(None);
        }

        let ethertype = u16::from_be_bytes([buf[12], buf[13]]);
        if ethertype != ETHERTYPE_EAPOL {
            return Ok(None);
        }

        let mut source = [0u8; 6];
        source.copy_from_slice(&buf[6..12]);
        Ok(Some(EapolPdu { source, pdu: buf[ETHER_HDR_LEN..received].to_vec() }))
    }
}

impl Drop for EapolSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
