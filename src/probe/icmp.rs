use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Payload size of every probe (standard ping)
pub const PAYLOAD_SIZE: usize = 56;

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    std::process::id() as u16
}

/// Build an ICMP Echo Request packet
pub fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + PAYLOAD_SIZE];

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);

        // Fill payload with pattern
        for (i, byte) in packet.payload_mut().iter_mut().enumerate() {
            *byte = (i & 0xFF) as u8;
        }
    }

    let cksum = IcmpPacket::new(&buffer).map(|p| checksum(&p));
    if let (Some(cksum), Some(mut packet)) = (cksum, MutableEchoRequestPacket::new(&mut buffer)) {
        packet.set_checksum(cksum);
    }

    buffer
}
