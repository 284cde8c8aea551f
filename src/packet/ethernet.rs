//! Ethernet frame utilities.
//!
//! The wrap/strip helpers work on slices and only allocate the output frame.

use bytes::{BufMut, Bytes, BytesMut};

/// A 48-bit hardware address.
pub type MacAddr = [u8; 6];

/// Ethernet frame types (EtherType).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    /// IPv4
    Ipv4 = 0x0800,
    /// ARP
    Arp = 0x0806,
    /// VLAN-tagged frame
    Vlan = 0x8100,
    /// IPv6
    Ipv6 = 0x86DD,
}

impl EtherType {
    /// Parse EtherType from a 16-bit value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x8100 => Some(Self::Vlan),
            0x86DD => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Extract EtherType from an Ethernet frame.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        Self::from_u16(u16::from_be_bytes([frame[12], frame[13]]))
    }
}

/// Ethernet header size.
pub const HEADER_SIZE: usize = 14;

/// Broadcast MAC address.
pub const BROADCAST_MAC: MacAddr = [0xFF; 6];

/// Zero MAC address.
pub const ZERO_MAC: MacAddr = [0x00; 6];

/// Parsed Ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        let mut dst = ZERO_MAC;
        let mut src = ZERO_MAC;
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Some(Self {
            dst,
            src,
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }

    pub fn is(&self, kind: EtherType) -> bool {
        self.ethertype == kind as u16
    }
}

/// Format a MAC address as a string.
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Check if a MAC address is multicast (broadcast included).
pub fn is_multicast(mac: &MacAddr) -> bool {
    mac[0] & 0x01 != 0
}

/// Generate a random locally administered unicast address.
pub fn random_mac() -> MacAddr {
    let mut mac: MacAddr = rand::random();
    mac[0] = (mac[0] & 0xFE) | 0x02;
    mac
}

/// Prepend an Ethernet header to an IP packet.
///
/// Returns `None` for an empty packet or an unknown IP version.
pub fn wrap_ip_in_ethernet(ip_packet: &[u8], dst_mac: &MacAddr, src_mac: &MacAddr) -> Option<Bytes> {
    if ip_packet.is_empty() {
        return None;
    }
    let ethertype = match ip_packet[0] >> 4 {
        4 => EtherType::Ipv4,
        6 => EtherType::Ipv6,
        _ => return None,
    };

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + ip_packet.len());
    frame.put_slice(dst_mac);
    frame.put_slice(src_mac);
    frame.put_u16(ethertype as u16);
    frame.put_slice(ip_packet);
    Some(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ethertype_from_frame() {
        let mut frame = [0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert_eq!(EtherType::from_frame(&frame), Some(EtherType::Ipv4));

        frame[13] = 0x06;
        assert_eq!(EtherType::from_frame(&frame), Some(EtherType::Arp));
        assert_eq!(EtherType::from_frame(&frame[..10]), None);
    }

    #[test]
    fn test_header_parse() {
        let mut frame = [0u8; 20];
        frame[0..6].copy_from_slice(&BROADCAST_MAC);
        frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
        frame[12] = 0x08;
        frame[13] = 0x06;
        let hdr = EthernetHeader::parse(&frame).unwrap();
        assert_eq!(hdr.dst, BROADCAST_MAC);
        assert_eq!(hdr.src, [2, 0, 0, 0, 0, 1]);
        assert!(hdr.is(EtherType::Arp));
    }

    #[test]
    fn test_format_mac() {
        let mac = [0x5E, 0x12, 0x34, 0x56, 0x78, 0x9A];
        assert_eq!(format_mac(&mac), "5e:12:34:56:78:9a");
    }

    #[test]
    fn test_multicast_and_random_mac() {
        assert!(is_multicast(&[0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]));
        assert!(is_multicast(&BROADCAST_MAC));
        assert!(!is_multicast(&[0x5E, 0x12, 0x34, 0x56, 0x78, 0x9A]));

        for _ in 0..16 {
            let mac = random_mac();
            assert!(!is_multicast(&mac));
            assert_eq!(mac[0] & 0x02, 0x02);
        }
    }

    #[test]
    fn test_wrap_ip_in_ethernet_ipv4() {
        let ip_packet: [u8; 20] = [
            0x45, 0x00, 0x00, 0x14, // version=4, IHL=5, total_len=20
            0x00, 0x00, 0x00, 0x00, // ID, flags, fragment
            0x40, 0x06, 0x00, 0x00, // TTL=64, proto=TCP
            0xC0, 0xA8, 0x01, 0x64, // src: 192.168.1.100
            0xC0, 0xA8, 0x01, 0x01, // dst: 192.168.1.1
        ];
        let dst_mac = BROADCAST_MAC;
        let src_mac = [0x02, 0x00, 0x5E, 0x00, 0x00, 0x01];

        let frame = wrap_ip_in_ethernet(&ip_packet, &dst_mac, &src_mac).unwrap();
        assert_eq!(frame.len(), 14 + 20);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(&frame[0..6], &dst_mac);
        assert_eq!(&frame[6..12], &src_mac);
        assert_eq!(&frame[14..], &ip_packet);
    }

    #[test]
    fn test_wrap_ip_in_ethernet_invalid_version() {
        let ip_packet = [0x00u8; 20];
        assert!(wrap_ip_in_ethernet(&ip_packet, &BROADCAST_MAC, &ZERO_MAC).is_none());
        assert!(wrap_ip_in_ethernet(&[], &BROADCAST_MAC, &ZERO_MAC).is_none());
    }
}
