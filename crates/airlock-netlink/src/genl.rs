//! Generic-netlink transport for the nl80211 family.
//!
//! Every command gets a unique sequence number which doubles as its
//! cancellation handle: `cancel` removes the completion before returning,
//! so a cancelled command's callback can never run. Incoming messages
//! that match no pending sequence are multicast notifications and go to
//! the registered group handlers.
//!
//! The transport is single-threaded; `dispatch` is called from the owning
//! event loop when the socket polls readable, and completions run to
//! completion before the next message is read.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};

use neli::attr::Attribute;
use neli::consts::nl::{NlmF, NlmFFlags};
use neli::consts::socket::NlFamily;
use neli::genl::{Genlmsghdr, Nlattr};
use neli::nl::{NlPayload, Nlmsghdr};
use neli::socket::NlSocketHandle;
use neli::types::GenlBuffer;
use tracing::{debug, trace, warn};

use crate::{NetlinkError, Result};

const NL80211_GENL_NAME: &str = "nl80211";
const NL80211_GENL_VERSION: u8 = 1;

pub type CommandId = u32;

/// A typed attribute value for command building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Flag,
    Bytes(Vec<u8>),
}

impl AttrValue {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            AttrValue::U8(v) => vec![*v],
            AttrValue::U16(v) => v.to_ne_bytes().to_vec(),
            AttrValue::U32(v) => v.to_ne_bytes().to_vec(),
            AttrValue::U64(v) => v.to_ne_bytes().to_vec(),
            AttrValue::Flag => Vec::new(),
            AttrValue::Bytes(b) => b.clone(),
        }
    }
}

/// An nl80211 command under construction. Pure data; building one does
/// not require a socket, which keeps the state machines testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenlCmd {
    pub cmd: u8,
    pub dump: bool,
    pub attrs: Vec<(u16, AttrValue)>,
}

impl GenlCmd {
    pub fn new(cmd: u8) -> GenlCmd {
        GenlCmd { cmd, dump: false, attrs: Vec::new() }
    }

    pub fn dump(mut self) -> Self {
        self.dump = true;
        self
    }

    pub fn u8(mut self, typ: u16, v: u8) -> Self {
        self.attrs.push((typ, AttrValue::U8(v)));
        self
    }

    pub fn u16(mut self, typ: u16, v: u16) -> Self {
        self.attrs.push((typ, AttrValue::U16(v)));
        self
    }

    pub fn u32(mut self, typ: u16, v: u32) -> Self {
        self.attrs.push((typ, AttrValue::U32(v)));
        self
    }

    pub fn u64(mut self, typ: u16, v: u64) -> Self {
        self.attrs.push((typ, AttrValue::U64(v)));
        self
    }

    pub fn flag(mut self, typ: u16) -> Self {
        self.attrs.push((typ, AttrValue::Flag));
        self
    }

    pub fn bytes(mut self, typ: u16, b: impl Into<Vec<u8>>) -> Self {
        self.attrs.push((typ, AttrValue::Bytes(b.into())));
        self
    }

    /// Attribute payload lookup, for tests and fake drivers.
    pub fn get(&self, typ: u16) -> Option<&AttrValue> {
        self.attrs.iter().find(|(t, _)| *t == typ).map(|(_, v)| v)
    }
}

/// An nl80211 message received from the kernel, detached from the neli
/// buffers so handlers can hold on to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenlResponse {
    pub cmd: u8,
    pub attrs: Vec<(u16, Vec<u8>)>,
}

impl GenlResponse {
    pub fn get(&self, typ: u16) -> Option<&[u8]> {
        self.attrs.iter().find(|(t, _)| *t == typ).map(|(_, v)| v.as_slice())
    }

    pub fn has(&self, typ: u16) -> bool {
        self.get(typ).is_some()
    }

    pub fn get_u8(&self, typ: u16) -> Option<u8> {
        self.get(typ).filter(|b| b.len() == 1).map(|b| b[0])
    }

    pub fn get_u16(&self, typ: u16) -> Option<u16> {
        self.get(typ).and_then(|b| b.try_into().ok()).map(u16::from_ne_bytes)
    }

    pub fn get_u32(&self, typ: u16) -> Option<u32> {
        self.get(typ).and_then(|b| b.try_into().ok()).map(u32::from_ne_bytes)
    }

    pub fn get_u64(&self, typ: u16) -> Option<u64> {
        self.get(typ).and_then(|b| b.try_into().ok()).map(u64::from_ne_bytes)
    }

    pub fn get_mac(&self, typ: u16) -> Option<[u8; 6]> {
        self.get(typ).and_then(|b| b.try_into().ok())
    }

    /// Parses an attribute's payload as a nested attribute stream.
    pub fn get_nested(&self, typ: u16) -> Option<Vec<(u16, Vec<u8>)>> {
        self.get(typ).map(parse_nested)
    }
}

/// Splits a buffer of packed netlink attributes.
pub fn parse_nested(mut buf: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let typ = u16::from_ne_bytes([buf[2], buf[3]]) & 0x3fff;
        if len < 4 || len > buf.len() {
            break;
        }
        out.push((typ, buf[4..len].to_vec()));
        let aligned = (len + 3) & !3;
        if aligned >= buf.len() {
            break;
        }
        buf = &buf[aligned..];
    }
    out
}

/// How a command concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Positive acknowledgement without payload.
    Ack,
    /// A response message carrying attributes.
    Response(GenlResponse),
    /// Kernel error; the value is a positive errno.
    Error(i32),
}

pub type ResponseHandler = Box<dyn FnOnce(CommandId, CommandOutcome)>;
pub type EventHandler = Box<dyn FnMut(&GenlResponse)>;

pub struct GenlTransport {
    sock: NlSocketHandle,
    family_id: u16,
    next_seq: u32,
    pending: HashMap<u32, ResponseHandler>,
    event_handlers: Vec<EventHandler>,
}

impl GenlTransport {
    /// Connects to generic netlink and resolves the nl80211 family.
    pub fn connect() -> Result<GenlTransport> {
        let mut sock = NlSocketHandle::connect(NlFamily::Generic, None, &[])
            .map_err(|e| NetlinkError::ConnectionFailed { reason: e.to_string() })?;
        let family_id = sock
            .resolve_genl_family(NL80211_GENL_NAME)
            .map_err(|e| NetlinkError::ResolveFailed { what: "nl80211 family", reason: e.to_string() })?;

        set_nonblocking(sock.as_raw_fd())?;

        Ok(GenlTransport {
            sock,
            family_id,
            next_seq: 1,
            pending: HashMap::new(),
            event_handlers: Vec::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Joins an nl80211 multicast group ("mlme", "config", ...).
    pub fn register_multicast(&mut self, group: &str) -> Result<()> {
        let id = self
            .sock
            .resolve_nl_mcast_group(NL80211_GENL_NAME, group)
            .map_err(|e| NetlinkError::ResolveFailed { what: "multicast group", reason: e.to_string() })?;
        self.sock
            .add_mcast_membership(&[id])
            .map_err(|e| NetlinkError::ConnectionFailed { reason: e.to_string() })?;
        Ok(())
    }

    /// Adds a handler for unsolicited messages. Handlers see every
    /// notification and filter by command and ifindex themselves.
    pub fn add_event_handler(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    /// Sends a command; `on_result` runs exactly once unless the command
    /// is cancelled first.
    pub fn send(&mut self, cmd: GenlCmd, on_result: ResponseHandler) -> Result<CommandId> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);

        let mut attrs = GenlBuffer::new();
        for (typ, value) in &cmd.attrs {
            let payload = value.to_bytes();
            let attr = Nlattr::new(false, false, *typ, payload.as_slice()).map_err(|e| {
                NetlinkError::SendFailed { operation: "attribute build", reason: e.to_string() }
            })?;
            attrs.push(attr);
        }

        let genlhdr = Genlmsghdr::new(cmd.cmd, NL80211_GENL_VERSION, attrs);
        let mut flags = vec![NlmF::Request, NlmF::Ack];
        if cmd.dump {
            flags.push(NlmF::Dump);
        }
        let nlhdr = Nlmsghdr::new(
            None,
            self.family_id,
            NlmFFlags::new(&flags),
            Some(seq),
            None,
            NlPayload::Payload(genlhdr),
        );

        self.sock.send(nlhdr).map_err(|e| NetlinkError::SendFailed {
            operation: "nl80211 command",
            reason: e.to_string(),
        })?;

        self.pending.insert(seq, on_result);
        trace!(seq, cmd = cmd.cmd, "nl80211 command sent");
        Ok(seq)
    }

    /// Drops a pending command's completion. After this returns the
    /// callback is guaranteed not to run.
    pub fn cancel(&mut self, id: CommandId) {
        if self.pending.remove(&id).is_some() {
            trace!(seq = id, "nl80211 command cancelled");
        }
    }

    /// Reads and routes every queued message. Called when the socket is
    /// readable.
    pub fn dispatch(&mut self) {
        loop {
            match self.sock.recv::<u16, Genlmsghdr<u8, u16>>() {
                Ok(Some(msg)) => self.route(msg),
                Ok(None) => break,
                Err(e) => {
                    if let Some(io) = io_error_of(&e) {
                        if io.kind() == std::io::ErrorKind::WouldBlock {
                            break;
                        }
                    }
                    warn!("nl80211 recv error: {e}");
                    break;
                }
            }
        }
    }

    fn route(&mut self, msg: Nlmsghdr<u16, Genlmsghdr<u8, u16>>) {
        let seq = msg.nl_seq;
        match msg.nl_payload {
            NlPayload::Payload(genl) => {
                let response = detach(&genl);
                if let Some(handler) = self.pending.remove(&seq) {
                    handler(seq, CommandOutcome::Response(response));
                } else {
                    for handler in &mut self.event_handlers {
                        handler(&response);
                    }
                }
            }
            NlPayload::Err(err) => {
                let outcome =
                    if err.error == 0 { CommandOutcome::Ack } else { CommandOutcome::Error(-err.error) };
                if let Some(handler) = self.pending.remove(&seq) {
                    handler(seq, outcome);
                } else {
                    debug!(seq, error = err.error, "kernel error for unknown sequence");
                }
            }
            NlPayload::Ack(_) => {
                if let Some(handler) = self.pending.remove(&seq) {
                    handler(seq, CommandOutcome::Ack);
                }
            }
            NlPayload::Empty => {}
        }
    }
}

fn detach(genl: &Genlmsghdr<u8, u16>) -> GenlResponse {
    let mut response = GenlResponse { cmd: genl.cmd, attrs: Vec::new() };
    for attr in genl.get_attr_handle().iter() {
        response.attrs.push((attr.nla_type.nla_type, attr.payload().as_ref().to_vec()));
    }
    response
}

fn io_error_of<T, P>(err: &neli::err::NlError<T, P>) -> Option<&std::io::Error> {
    match err {
        neli::err::NlError::Wrapped(neli::err::WrappedError::IOError(io)) => Some(io),
        _ => None,
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(NetlinkError::io("F_GETFL", std::io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(NetlinkError::io("F_SETFL", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_builder_records_attrs() {
        let cmd = GenlCmd::new(46).u32(3, 7).bytes(52, vec![1, 2, 3]).flag(66);
        assert_eq!(cmd.get(3), Some(&AttrValue::U32(7)));
        assert_eq!(cmd.get(52), Some(&AttrValue::Bytes(vec![1, 2, 3])));
        assert_eq!(cmd.get(66), Some(&AttrValue::Flag));
        assert_eq!(cmd.get(99), None);
    }

    #[test]
    fn response_typed_getters() {
        let response = GenlResponse {
            cmd: 46,
            attrs: vec![
                (3, 7u32.to_ne_bytes().to_vec()),
                (6, vec![1, 2, 3, 4, 5, 6]),
                (48, vec![]),
            ],
        };
        assert_eq!(response.get_u32(3), Some(7));
        assert_eq!(response.get_mac(6), Some([1, 2, 3, 4, 5, 6]));
        assert!(response.has(48));
        assert_eq!(response.get_u32(48), None);
    }

    #[test]
    fn nested_attr_stream() {
        // Two packed attributes: type 1 with u32, type 2 with 2 bytes
        // (padded to 4).
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u16.to_ne_bytes());
        buf.extend_from_slice(&1u16.to_ne_bytes());
        buf.extend_from_slice(&0xdeadbeefu32.to_ne_bytes());
        buf.extend_from_slice(&6u16.to_ne_bytes());
        buf.extend_from_slice(&2u16.to_ne_bytes());
        buf.extend_from_slice(&[0xaa, 0xbb, 0, 0]);

        let nested = parse_nested(&buf);
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0], (1, 0xdeadbeefu32.to_ne_bytes().to_vec()));
        assert_eq!(nested[1], (2, vec![0xaa, 0xbb]));
    }
}
