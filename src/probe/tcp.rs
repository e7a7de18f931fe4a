//! TCP handshake-timing transport.
//!
//! Used where ICMP sockets cannot be opened. Each probe is a connect attempt;
//! a completed handshake or an immediate refusal (RST) both prove the host
//! answered, and either counts as the reply.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ProbeProtocol;
use crate::error::{Error, Result};
use crate::probe::sender::{EventSink, PingSender};

pub struct TcpPingSender {
    port: u16,
    timeout: Duration,
    sink: EventSink,
    handle: Handle,
    cancel: CancellationToken,
}

impl TcpPingSender {
    /// Must be called from within a tokio runtime
    pub fn new(port: u16, timeout: Duration, sink: EventSink) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime("TCP ping sender"))?;
        Ok(Self {
            port,
            timeout,
            sink,
            handle,
            cancel: CancellationToken::new(),
        })
    }
}

impl PingSender for TcpPingSender {
    fn send_ping(&mut self, dest: Ipv4Addr, sequence: u16) {
        let addr = SocketAddr::V4(SocketAddrV4::new(dest, self.port));
        let timeout = self.timeout;
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();

        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => {
                    match result {
                        Ok(Ok(_stream)) => {
                            sink.reply(sequence);
                        }
                        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                            sink.reply(sequence);
                        }
                        Ok(Err(e)) => {
                            trace!(%addr, sequence, error = %e, "TCP probe failed");
                        }
                        Err(_) => {
                            trace!(%addr, sequence, "TCP probe timed out");
                        }
                    }
                }
            }
        });
    }

    fn protocol(&self) -> ProbeProtocol {
        ProbeProtocol::Tcp
    }
}

impl Drop for TcpPingSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
