//! Minimal IPv4 header access.

use std::net::Ipv4Addr;

/// Minimum IPv4 header length.
pub const MIN_HEADER_SIZE: usize = 20;

/// Addresses pulled out of an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the header of a raw IPv4 packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < MIN_HEADER_SIZE || packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((packet[0] & 0x0F) as usize) * 4;
        if ihl < MIN_HEADER_SIZE || packet.len() < ihl {
            return None;
        }
        Some(Self {
            protocol: packet[9],
            source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            destination: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = (MIN_HEADER_SIZE + payload.len()) as u16;
    let mut pkt = vec![0x45, 0x00];
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    pkt.extend_from_slice(payload);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        let pkt = test_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 9), b"hi");
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.protocol, 17);
        assert_eq!(hdr.source, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(hdr.destination, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert!(Ipv4Header::parse(&[0x45; 10]).is_none());
        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        assert!(Ipv4Header::parse(&v6).is_none());
        let mut short_ihl = [0u8; 20];
        short_ihl[0] = 0x42;
        assert!(Ipv4Header::parse(&short_ihl).is_none());
    }
}
