//! ICMP echo transport.
//!
//! Sends go out on the control task; a dedicated receive thread blocks on a
//! clone of the same socket and forwards matching replies through the
//! [`EventSink`].

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProbeProtocol;
use crate::error::{Error, Result};
use crate::probe::correlate::parse_echo_reply;
use crate::probe::icmp::{build_echo_request, get_identifier};
use crate::probe::sender::{EventSink, PingSender};

/// How often the receive thread checks for cancellation
const RECV_POLL: Duration = Duration::from_millis(200);

/// An ICMPv4 socket and whether it is the unprivileged datagram kind
pub struct IcmpSocket {
    pub socket: Socket,
    pub is_dgram: bool,
}

/// Open an ICMPv4 socket, preferring raw and falling back to datagram
pub fn create_icmp_socket() -> Result<IcmpSocket> {
    match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(socket) => Ok(IcmpSocket {
            socket,
            is_dgram: false,
        }),
        Err(raw_err) => match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
            Ok(socket) => Ok(IcmpSocket {
                socket,
                is_dgram: true,
            }),
            Err(dgram_err) => Err(Error::Socket(format!(
                "cannot open ICMP socket (raw: {}, dgram: {})",
                raw_err, dgram_err
            ))),
        },
    }
}

/// Send a packet to an IPv4 destination
pub fn send_icmp(socket: &Socket, packet: &[u8], dest: Ipv4Addr) -> Result<usize> {
    let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(dest, 0)));
    Ok(socket.send_to(packet, &addr)?)
}

pub struct IcmpPingSender {
    socket: Socket,
    identifier: u16,
    cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

impl IcmpPingSender {
    pub fn new(sink: EventSink) -> Result<Self> {
        let IcmpSocket { socket, is_dgram } = create_icmp_socket()?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(RECV_POLL))?;

        let identifier = get_identifier();
        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();

        let receiver = std::thread::Builder::new()
            .name("icmp-recv".into())
            .spawn(move || receive_loop(recv_socket, identifier, is_dgram, sink, thread_cancel))?;

        debug!(is_dgram, identifier, "ICMP sender ready");

        Ok(Self {
            socket,
            identifier,
            cancel,
            receiver: Some(receiver),
        })
    }
}

impl PingSender for IcmpPingSender {
    fn send_ping(&mut self, dest: Ipv4Addr, sequence: u16) {
        let packet = build_echo_request(self.identifier, sequence);
        if let Err(e) = send_icmp(&self.socket, &packet, dest) {
            // Reply never comes; the probe times out and is retried
            debug!(%dest, sequence, error = %e, "failed to send echo request");
        }
    }

    fn protocol(&self) -> ProbeProtocol {
        ProbeProtocol::Icmp
    }
}

impl Drop for IcmpPingSender {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The thread notices within one poll interval; don't block the control task on it
        drop(self.receiver.take());
    }
}

fn receive_loop(
    socket: Socket,
    identifier: u16,
    is_dgram: bool,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 1500];
    let mut reader = &socket;

    while !cancel.is_cancelled() {
        match reader.read(&mut buf) {
            Ok(len) => {
                if let Some(sequence) = parse_echo_reply(&buf[..len], identifier, is_dgram) {
                    if !sink.reply(sequence) {
                        break;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                if sink.is_closed() {
                    break;
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!(error = %e, "ICMP receive failed");
                    sink.error(e.to_string());
                }
                break;
            }
        }
    }

    debug!(generation = sink.generation(), "ICMP receiver stopped");
}
