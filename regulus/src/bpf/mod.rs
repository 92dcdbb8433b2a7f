pub mod handle;
pub mod kernel;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use handle::MapHandle;
pub use kernel::KernelMaps;
pub use memory::MemoryMaps;

use crate::Result;

pub const BPF_FS_DIR: &str = "/sys/fs/bpf";
pub const GLOBALS_DIR: &str = "tc/globals";

/// Raw byte access to one fixed-size hash map.
///
/// Implementations must be safe to call concurrently: the kernel provides
/// per-operation atomicity and the in-memory double mirrors it.
pub trait BpfMap: Send + Sync {
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Deleting an absent key is `Error::NotFound`.
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn get_state(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Opens the map pinned at `spec.path` or creates and pins a new one.
pub trait MapProvider: Send + Sync {
    fn open_or_create(&self, spec: &MapSpec) -> Result<Arc<dyn BpfMap>>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapSpec {
    pub path: PathBuf,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl MapSpec {
    pub fn new(path: impl Into<PathBuf>, key_size: usize, value_size: usize, max_entries: u32) -> Self {
        Self {
            path: path.into(),
            key_size: key_size as u32,
            value_size: value_size as u32,
            max_entries,
        }
    }

    /// Kernel object names are limited to 15 characters.
    pub fn kernel_name(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.chars().take(15).collect()
    }
}

pub fn globals_dir(bpf_fs: &Path) -> PathBuf {
    bpf_fs.join(GLOBALS_DIR)
}

/// Renders bytes the way `hexdump -C` does.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", line * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for b in chunk {
            if b.is_ascii_graphic() || *b == b' ' {
                out.push(*b as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kernel_name_is_truncated() {
        let spec = MapSpec::new(
            "/sys/fs/bpf/tc/globals/ep_l1_0123456789abcdef",
            4,
            4,
            4,
        );
        assert_eq!(spec.kernel_name(), "ep_l1_012345678");
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&[10, 0, 0, 5]);
        assert!(dump.starts_with("00000000  0a 00 00 05 "));
        assert!(dump.ends_with("|....|\n"));
        assert_eq!(hex_dump(&[0u8; 17]).lines().count(), 2);
    }
}
