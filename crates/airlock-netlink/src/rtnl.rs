//! Route-netlink helpers: interface flags, link mode and operational
//! state, and IPv4 address installation for the AP path.
//!
//! These requests are tiny and always answered immediately by the
//! kernel, so they run synchronously over a dedicated socket.

use std::io;
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::{NetlinkError, Result};

const RTM_SETLINK: u16 = 19;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_EXCL: u16 = 0x200;

const NLMSG_ERROR: u16 = 2;

const IFLA_OPERSTATE: u16 = 16;
const IFLA_LINKMODE: u16 = 17;

const IFA_LOCAL: u16 = 2;

/// RFC 2863 operational states used on the STA path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperState {
    Dormant = 5,
    Up = 6,
}

/// IF_LINK_MODE values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkMode {
    Default = 0,
    Dormant = 1,
}

pub struct RtnlSocket {
    fd: RawFd,
    seq: u32,
}

impl RtnlSocket {
    pub fn connect() -> Result<RtnlSocket> {
        let fd = unsafe {
            libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::NETLINK_ROUTE)
        };
        if fd < 0 {
            return Err(NetlinkError::io("rtnetlink socket", io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetlinkError::io("rtnetlink bind", err));
        }

        Ok(RtnlSocket { fd, seq: 1 })
    }

    /// Brings the interface administratively up.
    pub fn set_link_up(&mut self, ifindex: u32) -> Result<()> {
        let msg = self.build_link_msg(RTM_SETLINK, ifindex, libc::IFF_UP as u32, libc::IFF_UP as u32, &[]);
        self.request_ack(msg, "RTM_SETLINK up")
    }

    pub fn set_link_down(&mut self, ifindex: u32) -> Result<()> {
        let msg = self.build_link_msg(RTM_SETLINK, ifindex, 0, libc::IFF_UP as u32, &[]);
        self.request_ack(msg, "RTM_SETLINK down")
    }

    /// Sets IFLA_LINKMODE and IFLA_OPERSTATE in one message. The STA FSM
    /// moves the link Dormant before keys are up, then Up.
    pub fn set_link_mode(&mut self, ifindex: u32, mode: LinkMode, state: OperState) -> Result<()> {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, IFLA_LINKMODE, &[mode as u8]);
        push_attr(&mut attrs, IFLA_OPERSTATE, &[state as u8]);
        let msg = self.build_link_msg(RTM_SETLINK, ifindex, 0, 0, &attrs);
        self.request_ack(msg, "RTM_SETLINK linkmode")
    }

    /// Queries the interface flags (IFF_UP and friends).
    pub fn link_flags(&mut self, ifindex: u32) -> Result<u32> {
        let msg = self.build_link_msg(RTM_GETLINK, ifindex, 0, 0, &[]);
        let sent = unsafe { libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if sent < 0 {
            return Err(NetlinkError::io("RTM_GETLINK", io::Error::last_os_error()));
        }

        let mut buf = [0u8; 8192];
        let received =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if received < 0 {
            return Err(NetlinkError::io("RTM_GETLINK", io::Error::last_os_error()));
        }
        let received = received as usize;
        if received < 16 + 16 {
            return Err(NetlinkError::Kernel { operation: "RTM_GETLINK", errno: libc::EBADMSG });
        }

        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if msg_type == NLMSG_ERROR {
            let errno = i32::from_ne_bytes(buf[16..20].try_into().unwrap());
            return Err(NetlinkError::Kernel { operation: "RTM_GETLINK", errno: -errno });
        }

        // nlmsghdr then ifinfomsg; flags sit at offset 8 of the latter.
        Ok(u32::from_ne_bytes(buf[24..28].try_into().unwrap()))
    }

    /// Installs an IPv4 address with the given prefix length.
    pub fn add_address(&mut self, ifindex: u32, address: [u8; 4], prefix_len: u8) -> Result<()> {
        let msg = self.build_addr_msg(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            ifindex,
            address,
            prefix_len,
        );
        self.request_ack(msg, "RTM_NEWADDR")
    }

    pub fn del_address(&mut self, ifindex: u32, address: [u8; 4], prefix_len: u8) -> Result<()> {
        let msg =
            self.build_addr_msg(RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK, ifindex, address, prefix_len);
        self.request_ack(msg, "RTM_DELADDR")
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1).max(1);
        seq
    }

    fn build_link_msg(
        &mut self,
        msg_type: u16,
        ifindex: u32,
        flags: u32,
        change: u32,
        attrs: &[u8],
    ) -> Vec<u8> {
        let seq = self.next_seq();
        let mut out = nlmsghdr(msg_type, NLM_F_REQUEST | NLM_F_ACK, seq, 16 + attrs.len());
        // struct ifinfomsg
        out.push(libc::AF_UNSPEC as u8);
        out.push(0);
        out.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
        out.extend_from_slice(&(ifindex as i32).to_ne_bytes());
        out.extend_from_slice(&flags.to_ne_bytes());
        out.extend_from_slice(&change.to_ne_bytes());
        out.extend_from_slice(attrs);
        out
    }

    fn build_addr_msg(
        &mut self,
        msg_type: u16,
        flags: u16,
        ifindex: u32,
        address: [u8; 4],
        prefix_len: u8,
    ) -> Vec<u8> {
        let mut attrs = Vec::new();
        push_attr(&mut attrs, IFA_LOCAL, &address);

        let seq = self.next_seq();
        let mut out = nlmsghdr(msg_type, flags, seq, 8 + attrs.len());
        // struct ifaddrmsg
        out.push(libc::AF_INET as u8);
        out.push(prefix_len);
        out.push(0); // flags
        out.push(0); // scope
        out.extend_from_slice(&ifindex.to_ne_bytes());
        out.extend_from_slice(&attrs);
        out
    }

    fn request_ack(&mut self, msg: Vec<u8>, operation: &'static str) -> Result<()> {
        let sent = unsafe { libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if sent < 0 {
            return Err(NetlinkError::io(operation, io::Error::last_os_error()));
        }

        let mut buf = [0u8; 4096];
        let received =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if received < 0 {
            return Err(NetlinkError::io(operation, io::Error::last_os_error()));
        }
        let received = received as usize;
        if received < 16 + 4 {
            return Err(NetlinkError::Kernel { operation, errno: libc::EBADMSG });
        }

        let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
        if msg_type == NLMSG_ERROR {
            let errno = i32::from_ne_bytes(buf[16..20].try_into().unwrap());
            if errno != 0 {
                debug!(operation, errno, "rtnetlink request failed");
                return Err(NetlinkError::Kernel { operation, errno: -errno });
            }
        }
        Ok(())
    }
}

impl Drop for RtnlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn nlmsghdr(msg_type: u16, flags: u16, seq: u32, payload_len: usize) -> Vec<u8> {
    let len = 16 + payload_len;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&(len as u32).to_ne_bytes());
    out.extend_from_slice(&msg_type.to_ne_bytes());
    out.extend_from_slice(&flags.to_ne_bytes());
    out.extend_from_slice(&seq.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes()); // pid
    out
}

fn push_attr(out: &mut Vec<u8>, typ: u16, payload: &[u8]) {
    let len = 4 + payload.len();
    out.extend_from_slice(&(len as u16).to_ne_bytes());
    out.extend_from_slice(&typ.to_ne_bytes());
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
