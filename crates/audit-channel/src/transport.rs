use std::{
    os::fd::{AsRawFd, OwnedFd},
    time::Duration,
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, poll},
    sys::socket::{
        AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
        sendto, socket,
    },
};

/// How long a receive may wait for the next datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Timeout(Duration),
}

/// Datagram transport to the kernel audit subsystem.
pub trait Transport: Send {
    /// Send one complete request datagram.
    fn send(&mut self, data: &[u8]) -> Result<(), nix::Error>;

    /// Receive one datagram into `buf`. `Ok(None)` means nothing arrived
    /// within `wait`.
    fn recv(&mut self, buf: &mut [u8], wait: Wait) -> Result<Option<usize>, nix::Error>;
}

/// `NETLINK_AUDIT` socket. Closed on drop.
#[derive(Debug)]
pub struct NetlinkTransport {
    fd: OwnedFd,
}

impl NetlinkTransport {
    pub fn open() -> Result<Self, nix::Error> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkAudit,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        log::debug!("opened audit netlink socket fd {}", fd.as_raw_fd());
        Ok(Self { fd })
    }
}

impl Transport for NetlinkTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), nix::Error> {
        let kernel = NetlinkAddr::new(0, 0);
        loop {
            match sendto(self.fd.as_raw_fd(), data, &kernel, MsgFlags::empty()) {
                Ok(sent) if sent == data.len() => return Ok(()),
                Ok(_) => return Err(Errno::EMSGSIZE),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8], wait: Wait) -> Result<Option<usize>, nix::Error> {
        if let Wait::Timeout(timeout) = wait {
            let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;
            let mut fds = [PollFd::new(&self.fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) | Err(Errno::EINTR) => return Ok(None),
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }
        match recv(self.fd.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT) {
            Ok(len) => Ok(Some(len)),
            Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
