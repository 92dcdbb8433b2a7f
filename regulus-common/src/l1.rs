use core::fmt::Display;

use bytemuck::{Pod, Zeroable};

use crate::{Ipv4Octets, MapKey, MapRecord};

/// Maximum number of addresses tracked per endpoint. Must match the kernel
/// program's map definition.
pub const L1_MAX_KEYS: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
pub struct L1Key {
    pub address: Ipv4Octets,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct L1Value {
    pub tx_count: u16,
    pub rx_count: u16,
}

const _: () = assert!(core::mem::size_of::<L1Key>() == 4);
const _: () = assert!(core::mem::size_of::<L1Value>() == 4);

impl MapRecord for L1Key {}

impl MapKey for L1Key {
    type Value = L1Value;
}

impl MapRecord for L1Value {}

impl Display for L1Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Display for L1Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tx={} rx={}", self.tx_count, self.rx_count)
    }
}
