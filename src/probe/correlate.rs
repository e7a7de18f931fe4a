use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;

/// Extract the sequence number of an Echo Reply to one of our probes
///
/// Raw sockets deliver the IPv4 header in front of the ICMP message and see
/// every reply on the host, so the identifier must match. Datagram ICMP
/// sockets are already filtered by the kernel (which rewrites the identifier
/// to the socket's port), so no identifier check is made. Linux strips the IP
/// header on datagram sockets and macOS keeps it; both layouts are accepted.
///
/// Returns None if:
/// - Packet is malformed
/// - Packet is not an Echo Reply
/// - Packet is not a response to our probe (wrong identifier)
pub fn parse_echo_reply(data: &[u8], our_identifier: u16, is_dgram: bool) -> Option<u16> {
    let has_ip_header = data.first().is_some_and(|b| b >> 4 == 4);
    let icmp_data = if is_dgram && !has_ip_header {
        data
    } else {
        let ip_packet = Ipv4Packet::new(data)?;
        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        data.get(ip_header_len..)?
    };

    if icmp_data.len() < 8 {
        return None;
    }

    let icmp_packet = IcmpPacket::new(icmp_data)?;
    if icmp_packet.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }

    // Echo Reply: identifier and sequence are in bytes 4-7
    let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
    let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);

    if !is_dgram && identifier != our_identifier {
        return None;
    }

    Some(sequence)
}
