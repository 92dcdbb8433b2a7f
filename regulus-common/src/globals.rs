//! Records of the node-wide maps pinned under the globals directory.

use core::fmt::Display;
use core::net::Ipv4Addr;

use bytemuck::{Pod, Zeroable};

use crate::{Ipv4Octets, MapKey, MapRecord};

pub const G1_MAX_KEYS: u32 = 1024;
pub const G2_MAX_KEYS: u32 = 1024;
pub const G3_MAX_KEYS: u32 = 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
pub struct G1Key {
    pub id: u32,
}

/// The MAC is packed little-endian: octet 0 in the lowest byte.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct G1Value {
    pub id: u16,
    pub _pad: [u8; 6],
    pub mac: u64,
}

impl G1Value {
    pub fn new(id: u16, mac: [u8; 6]) -> Self {
        let mut packed = [0u8; 8];
        packed[..6].copy_from_slice(&mac);
        Self {
            id,
            _pad: [0; 6],
            mac: u64::from_le_bytes(packed),
        }
    }

    pub fn mac_octets(&self) -> [u8; 6] {
        let packed = self.mac.to_le_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&packed[..6]);
        out
    }
}

/// Keyed by the IPv4 address. Stored in host order, the kernel expects
/// network order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
pub struct G2Key {
    pub address: u32,
}

impl From<Ipv4Addr> for G2Key {
    fn from(value: Ipv4Addr) -> Self {
        Self {
            address: value.to_bits(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct G2Value {
    /// Same address as the key, host order.
    pub id: u32,
    pub _pad: u32,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

impl G2Value {
    pub fn new(key: G2Key) -> Self {
        Self {
            id: key.address,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
pub struct G3Key {
    pub address: Ipv4Octets,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct G3Value {
    pub count: u16,
}

const _: () = assert!(core::mem::size_of::<G1Value>() == 16);
const _: () = assert!(core::mem::size_of::<G2Value>() == 24);
const _: () = assert!(core::mem::size_of::<G3Value>() == 2);

impl MapRecord for G1Key {}

impl MapKey for G1Key {
    type Value = G1Value;
}

impl MapRecord for G1Value {}

impl MapRecord for G2Key {
    fn convert(&self) -> Self {
        Self {
            address: self.address.to_be(),
        }
    }
}

impl MapKey for G2Key {
    type Value = G2Value;
}

impl MapRecord for G2Value {
    fn convert(&self) -> Self {
        Self {
            id: self.id.to_be(),
            ..*self
        }
    }
}

impl MapRecord for G3Key {}

impl MapKey for G3Key {
    type Value = G3Value;
}

impl MapRecord for G3Value {}

impl Display for G1Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Display for G1Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let m = self.mac_octets();
        write!(
            f,
            "id={} mac={:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.id, m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Display for G2Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", Ipv4Addr::from_bits(self.address))
    }
}

impl Display for G2Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "id={} tx={} rx={}",
            Ipv4Addr::from_bits(self.id),
            self.tx_packets,
            self.rx_packets
        )
    }
}

impl Display for G3Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Display for G3Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "count={}", self.count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_g2_key_convert_is_network_order() {
        let key = G2Key::from(Ipv4Addr::new(10, 0, 0, 9));
        let mut buf = [0u8; G2Key::SIZE];
        key.convert().encode(&mut buf).unwrap();
        assert_eq!(buf, [10, 0, 0, 9]);

        let decoded = G2Key::decode(&buf).unwrap().convert();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_g2_value_follows_repr_c_layout() {
        let value = G2Value::new(G2Key { address: 1 });
        let value = G2Value {
            tx_packets: 3,
            rx_packets: 4,
            ..value
        };
        let mut buf = [0xffu8; G2Value::SIZE];
        value.encode(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &1u32.to_ne_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(&buf[8..16], &3u64.to_ne_bytes());
        assert_eq!(&buf[16..24], &4u64.to_ne_bytes());
        assert_eq!(G2Value::decode(&buf).unwrap(), value);
        assert!(G2Value::decode(&buf[..23]).is_err());
    }

    #[test]
    fn test_g1_mac_packing() {
        let value = G1Value::new(7, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(value.mac & 0xff, 0xaa);
        assert_eq!(value.mac >> 48, 0);
        assert_eq!(value.mac_octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let mut buf = [0u8; G1Value::SIZE];
        value.encode(&mut buf).unwrap();
        assert_eq!(G1Value::decode(&buf).unwrap(), value);
    }

    #[test]
    fn test_g3_round_trip() {
        let key = G3Key {
            address: Ipv4Addr::new(192, 168, 1, 1).into(),
        };
        let mut buf = [0u8; G3Key::SIZE];
        key.encode(&mut buf).unwrap();
        assert_eq!(buf, [192, 168, 1, 1]);
        assert_eq!(key.new_value(), G3Value { count: 0 });
    }
}
