use std::sync::Arc;

use libbpf_rs::{MapCore, MapFlags, MapType};
use tracing::{debug, info};

use crate::bpf::{BpfMap, MapProvider, MapSpec};
use crate::{Error, Result};

/// Hash maps pinned on the bpf filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelMaps;

pub struct PinnedMap {
    map: libbpf_rs::MapHandle,
}

impl MapProvider for KernelMaps {
    fn open_or_create(&self, spec: &MapSpec) -> Result<Arc<dyn BpfMap>> {
        if spec.path.exists() {
            let map = libbpf_rs::MapHandle::from_pinned_path(&spec.path)?;
            if map.key_size() != spec.key_size || map.value_size() != spec.value_size {
                return Err(Error::Resource(format!(
                    "map {} has key/value size {}/{}, expected {}/{}",
                    spec.path.display(),
                    map.key_size(),
                    map.value_size(),
                    spec.key_size,
                    spec.value_size
                )));
            }
            debug!(path = %spec.path.display(), "opened pinned map");
            return Ok(Arc::new(PinnedMap { map }));
        }

        if let Some(parent) = spec.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = libbpf_sys::bpf_map_create_opts {
            sz: std::mem::size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };
        let mut map = libbpf_rs::MapHandle::create(
            MapType::Hash,
            Some(spec.kernel_name()),
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            &opts,
        )?;
        map.pin(&spec.path).map_err(|e| {
            Error::Resource(format!("failed to pin map at {}: {e}", spec.path.display()))
        })?;
        info!(path = %spec.path.display(), "created map");
        Ok(Arc::new(PinnedMap { map }))
    }
}

impl BpfMap for PinnedMap {
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.map.update(key, value, MapFlags::ANY)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        match self.map.delete(key) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), libbpf_rs::ErrorKind::NotFound) => {
                Err(Error::NotFound("map entry".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lookup(key, MapFlags::ANY)?)
    }

    fn get_state(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for key in self.map.keys() {
            // entries can disappear between key iteration and lookup
            if let Some(value) = self.map.lookup(&key, MapFlags::ANY)? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_map_outside_bpffs_is_resource_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = MapSpec::new(dir.path().join("globals").join("regulus_g3"), 4, 2, 8);
        // either creation is refused or the pin is rejected off bpffs
        let Err(err) = KernelMaps.open_or_create(&spec) else {
            panic!("map pinned outside the bpf filesystem");
        };
        assert!(matches!(err, Error::Resource(_)));
        assert!(!spec.path.exists());
        Ok(())
    }
}
