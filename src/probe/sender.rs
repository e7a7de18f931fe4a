//! Transport abstraction between the monitor and the wire.
//!
//! A [`PingSender`] only transmits. Replies and failures travel back to the
//! control task through an [`EventSink`], which tags them with the sweep
//! generation the sender was created for.

use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, ProbeProtocol};
use crate::error::Result;
use crate::probe::socket::IcmpPingSender;
use crate::probe::tcp::TcpPingSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Echo (or handshake) answered for this sequence
    Reply(u16),
    /// The transport cannot continue
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

pub type EventTx = mpsc::UnboundedSender<TransportEvent>;
pub type EventRx = mpsc::UnboundedReceiver<TransportEvent>;

/// Hands transport events to the control task
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: EventTx,
}

impl EventSink {
    pub fn new(generation: u64, tx: EventTx) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the control task has gone away
    pub fn reply(&self, sequence: u16) -> bool {
        self.emit(TransportEventKind::Reply(sequence))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(TransportEventKind::Error(message.into()))
    }

    fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sends one probe per call. Dropping the sender tears the transport down.
pub trait PingSender: Send {
    fn send_ping(&mut self, dest: Ipv4Addr, sequence: u16);

    fn protocol(&self) -> ProbeProtocol;
}

/// Builds a transport at the start of each sweep
pub trait SenderFactory: Send {
    fn create(&self, sink: EventSink) -> Result<Box<dyn PingSender>>;
}

/// ICMP when the OS allows it, TCP handshake timing otherwise
#[derive(Debug, Clone)]
pub struct SystemSenderFactory {
    protocol: ProbeProtocol,
    tcp_port: u16,
    timeout: Duration,
}

impl SystemSenderFactory {
    pub fn new(protocol: ProbeProtocol, tcp_port: u16, timeout: Duration) -> Self {
        Self {
            protocol,
            tcp_port,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.protocol, config.tcp_port, config.probe_timeout)
    }

    fn tcp(&self, sink: EventSink) -> Result<Box<dyn PingSender>> {
        Ok(Box::new(TcpPingSender::new(self.tcp_port, self.timeout, sink)?))
    }
}

impl SenderFactory for SystemSenderFactory {
    fn create(&self, sink: EventSink) -> Result<Box<dyn PingSender>> {
        match self.protocol {
            ProbeProtocol::Icmp => Ok(Box::new(IcmpPingSender::new(sink)?)),
            ProbeProtocol::Tcp => self.tcp(sink),
            ProbeProtocol::Auto => match IcmpPingSender::new(sink.clone()) {
                Ok(sender) => Ok(Box::new(sender)),
                Err(e) if e.allows_fallback() => {
                    info!(
                        error = %e,
                        port = self.tcp_port,
                        "ICMP unavailable, falling back to TCP handshake timing"
                    );
                    self.tcp(sink)
                }
                Err(e) => {
                    warn!(error = %e, "ICMP sender failed");
                    Err(e)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.reply(42));
        assert!(sink.error("boom"));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.generation, 7);
        assert_eq!(ev.kind, TransportEventKind::Reply(42));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, TransportEventKind::Error("boom".into()));
    }

    #[test]
    fn test_sink_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.reply(1));
    }

    #[tokio::test]
    async fn test_tcp_factory() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = SystemSenderFactory::new(ProbeProtocol::Tcp, 80, Duration::from_secs(1));
        let sender = factory.create(EventSink::new(0, tx)).unwrap();
        assert_eq!(sender.protocol(), ProbeProtocol::Tcp);
    }
}
