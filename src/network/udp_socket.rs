use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use tracing::warn;

use crate::network::codec;
use crate::{network::messages::Message, NonBlockingSocket};

const RECV_BUFFER_SIZE: usize = 4096;

/// A ready-made non-blocking UDP socket for Palisade sessions. Listens on
/// `0.0.0.0` at a given port.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds a UDP socket to `0.0.0.0:port` and puts it into non-blocking
    /// mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let bytes = match codec::encode(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to serialize outbound message: {err}");
                return;
            },
        };
        // UDP is best-effort; a failed send is just a lost packet and the
        // protocol retransmits on its own schedule
        if let Err(err) = self.socket.send_to(&bytes, addr) {
            warn!("failed to send UDP packet to {addr}: {err}");
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut messages = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, src_addr)) => {
                    if let Ok(msg) = codec::decode(&self.buffer[..len]) {
                        messages.push((src_addr, msg));
                    }
                    // undecodable datagrams (foreign traffic, corruption) are
                    // dropped without comment
                },
                // no more queued datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return messages,
                // datagram sockets surface this after send_to on some platforms
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!("unexpected socket error: {err}");
                    return messages;
                },
            }
        }
    }
}
