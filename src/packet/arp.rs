//! ARP packets over Ethernet/IPv4.
//!
//! Used by the tap adapter to play a small ARP stack in TUN mode, and by the
//! switch to learn neighbors from ARP traffic crossing the bridge.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::ethernet::{EtherType, MacAddr, BROADCAST_MAC, HEADER_SIZE, ZERO_MAC};

/// Length of an Ethernet/IPv4 ARP body.
pub const ARP_LEN: usize = 28;

/// Minimum Ethernet frame length ARP frames are padded to.
const MIN_FRAME_LEN: usize = 60;

/// ARP operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOperation {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            _ => Err(()),
        }
    }
}

/// A decoded ARP packet together with its Ethernet addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub eth_dst: MacAddr,
    pub eth_src: MacAddr,
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// A broadcast request asking who has `target_ip`.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            eth_dst: BROADCAST_MAC,
            eth_src: sender_mac,
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: ZERO_MAC,
            target_ip,
        }
    }

    /// A unicast reply to `request` announcing `mac` for the requested IP.
    pub fn reply_to(request: &ArpPacket, mac: MacAddr) -> Self {
        Self {
            eth_dst: request.sender_mac,
            eth_src: mac,
            operation: ArpOperation::Reply,
            sender_mac: mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    /// Parse an Ethernet frame carrying Ethernet/IPv4 ARP.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE + ARP_LEN {
            return None;
        }
        if EtherType::from_frame(frame) != Some(EtherType::Arp) {
            return None;
        }

        let arp = &frame[HEADER_SIZE..];
        // Hardware type Ethernet, protocol IPv4, address lengths 6/4
        if arp[0..2] != [0x00, 0x01] || arp[2..4] != [0x08, 0x00] || arp[4] != 6 || arp[5] != 4 {
            return None;
        }
        let operation = ArpOperation::try_from(u16::from_be_bytes([arp[6], arp[7]])).ok()?;

        Some(Self {
            eth_dst: mac_at(frame, 0),
            eth_src: mac_at(frame, 6),
            operation,
            sender_mac: mac_at(arp, 8),
            sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_mac: mac_at(arp, 18),
            target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        })
    }

    /// Serialize into a padded Ethernet frame.
    pub fn to_frame(&self) -> Bytes {
        let mut packet = BytesMut::with_capacity(MIN_FRAME_LEN);

        // Ethernet header
        packet.put_slice(&self.eth_dst);
        packet.put_slice(&self.eth_src);
        packet.put_u16(EtherType::Arp as u16);

        // ARP header
        packet.put_u16(0x0001); // Hardware type: Ethernet
        packet.put_u16(0x0800); // Protocol type: IPv4
        packet.put_u8(6);
        packet.put_u8(4);
        packet.put_u16(self.operation as u16);

        packet.put_slice(&self.sender_mac);
        packet.put_slice(&self.sender_ip.octets());
        packet.put_slice(&self.target_mac);
        packet.put_slice(&self.target_ip.octets());

        packet.resize(MIN_FRAME_LEN, 0);
        packet.freeze()
    }
}

fn mac_at(buf: &[u8], offset: usize) -> MacAddr {
    let mut mac = ZERO_MAC;
    mac.copy_from_slice(&buf[offset..offset + 6]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    const OURS: MacAddr = [0x5E, 0x12, 0x34, 0x56, 0x78, 0x9A];
    const PEER: MacAddr = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    #[test]
    fn test_build_request() {
        let req = ArpPacket::request(OURS, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));
        let frame = req.to_frame();
        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[..6], &BROADCAST_MAC);
        assert_eq!(&frame[6..12], &OURS);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[20..22], &[0x00, 0x01]);
        assert_eq!(&frame[38..42], &[10, 0, 0, 1]);

        assert_eq!(ArpPacket::parse(&frame), Some(req));
    }

    #[test]
    fn test_reply_to_request() {
        let req = ArpPacket::request(PEER, Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 5));
        let reply = ArpPacket::reply_to(&req, OURS);
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.eth_dst, PEER);
        assert_eq!(reply.sender_mac, OURS);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(reply.target_ip, Ipv4Addr::new(10, 0, 0, 7));

        let parsed = ArpPacket::parse(&reply.to_frame()).unwrap();
        assert_eq!(parsed.target_mac, PEER);
    }

    #[test]
    fn test_parse_rejects_non_arp() {
        let mut frame = ArpPacket::request(OURS, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST)
            .to_frame()
            .to_vec();
        assert!(ArpPacket::parse(&frame[..30]).is_none());

        // Unknown operation
        frame[21] = 9;
        assert!(ArpPacket::parse(&frame).is_none());

        // IPv4 ethertype
        frame[21] = 1;
        frame[13] = 0x00;
        assert!(ArpPacket::parse(&frame).is_none());
    }
}
