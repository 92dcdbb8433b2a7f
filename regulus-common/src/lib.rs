#![no_std]

pub mod globals;
pub mod l1;

use core::fmt::Display;

use bytemuck::{Pod, Zeroable};

/// Fixed-width binary record stored in a kernel hash map.
///
/// The `#[repr(C)]` layout is the wire format: records derive `Pod` with
/// explicit padding fields, so encoding is a byte copy.
pub trait MapRecord: Pod {
    const SIZE: usize = core::mem::size_of::<Self>();

    /// Writes the record into `buf` in native byte order.
    fn encode(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        check_len(buf, Self::SIZE)?;
        buf.copy_from_slice(bytemuck::bytes_of(self));
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        check_len(buf, Self::SIZE)?;
        Ok(bytemuck::pod_read_unaligned(buf))
    }

    /// Byte order normalization between userspace and the kernel program.
    /// Applying it twice yields the original record.
    fn convert(&self) -> Self {
        *self
    }
}

/// A record usable as a map key. Declares the companion value type so a
/// lookup miss can still be typed.
pub trait MapKey: MapRecord {
    type Value: MapRecord + Default;

    fn new_value(&self) -> Self::Value {
        Self::Value::default()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LayoutError {
    pub expected: usize,
    pub actual: usize,
}

impl Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "record layout expects {} bytes, buffer has {}",
            self.expected, self.actual
        )
    }
}

impl core::error::Error for LayoutError {}

pub(crate) fn check_len(buf: &[u8], expected: usize) -> Result<(), LayoutError> {
    if buf.len() != expected {
        return Err(LayoutError {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Four IPv4 octets in network order, as the kernel programs store them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct Ipv4Octets {
    pub addr: [u8; 4],
}

impl From<core::net::Ipv4Addr> for Ipv4Octets {
    fn from(value: core::net::Ipv4Addr) -> Self {
        Self {
            addr: value.octets(),
        }
    }
}

impl From<Ipv4Octets> for core::net::Ipv4Addr {
    fn from(value: Ipv4Octets) -> Self {
        core::net::Ipv4Addr::from(value.addr)
    }
}

impl Display for Ipv4Octets {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", core::net::Ipv4Addr::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(check_len(&[0u8; 4], 4).is_ok());
        assert_eq!(
            check_len(&[0u8; 3], 4),
            Err(LayoutError {
                expected: 4,
                actual: 3
            })
        );
    }
}
