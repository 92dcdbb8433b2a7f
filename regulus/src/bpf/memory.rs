use std::path::PathBuf;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;

use crate::bpf::{BpfMap, MapProvider, MapSpec};
use crate::{Error, Result};

/// Maps kept in process memory, keyed by their pin path. Used for dry runs
/// and tests. Reopening a path returns the same table, like a pinned map.
#[derive(Default)]
pub struct MemoryMaps {
    maps: Mutex<HashMap<PathBuf, Arc<MemoryMap>>>,
}

pub struct MemoryMap {
    spec: MapSpec,
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MapProvider for MemoryMaps {
    fn open_or_create(&self, spec: &MapSpec) -> Result<Arc<dyn BpfMap>> {
        let mut maps = self.maps.lock();
        if let Some(existing) = maps.get(&spec.path) {
            if existing.spec.key_size != spec.key_size
                || existing.spec.value_size != spec.value_size
            {
                return Err(Error::Resource(format!(
                    "map {} has key/value size {}/{}, expected {}/{}",
                    spec.path.display(),
                    existing.spec.key_size,
                    existing.spec.value_size,
                    spec.key_size,
                    spec.value_size
                )));
            }
            return Ok(existing.clone());
        }
        let map = Arc::new(MemoryMap {
            spec: spec.clone(),
            entries: Mutex::new(HashMap::default()),
        });
        maps.insert(spec.path.clone(), map.clone());
        Ok(map)
    }
}

impl MemoryMap {
    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.spec.key_size as usize {
            return Err(Error::Resource(format!(
                "key of {} bytes for map with key size {}",
                key.len(),
                self.spec.key_size
            )));
        }
        Ok(())
    }
}

impl BpfMap for MemoryMap {
    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if value.len() != self.spec.value_size as usize {
            return Err(Error::Resource(format!(
                "value of {} bytes for map with value size {}",
                value.len(),
                self.spec.value_size
            )));
        }
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) && entries.len() >= self.spec.max_entries as usize {
            return Err(Error::Resource(format!(
                "map {} is full ({} entries)",
                self.spec.path.display(),
                self.spec.max_entries
            )));
        }
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        match self.entries.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound("map entry".into())),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn get_state(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(path: &str, max_entries: u32) -> MapSpec {
        MapSpec::new(path, 4, 2, max_entries)
    }

    #[test]
    fn test_reopen_returns_same_table() -> Result<()> {
        let maps = MemoryMaps::new();
        let first = maps.open_or_create(&spec("/globals/g3", 8))?;
        first.update(&[1, 2, 3, 4], &[5, 0])?;

        let second = maps.open_or_create(&spec("/globals/g3", 8))?;
        assert_eq!(second.get(&[1, 2, 3, 4])?, Some(vec![5, 0]));
        assert_eq!(maps.len(), 1);
        Ok(())
    }

    #[test]
    fn test_size_mismatch_on_reopen() -> Result<()> {
        let maps = MemoryMaps::new();
        maps.open_or_create(&spec("/globals/g3", 8))?;
        let err = maps
            .open_or_create(&MapSpec::new("/globals/g3", 4, 4, 8))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Resource(_)));
        Ok(())
    }

    #[test]
    fn test_full_map_rejects_new_keys_only() -> Result<()> {
        let maps = MemoryMaps::new();
        let map = maps.open_or_create(&spec("/l1", 1))?;
        map.update(&[1, 1, 1, 1], &[1, 0])?;
        map.update(&[1, 1, 1, 1], &[2, 0])?;
        let err = map.update(&[2, 2, 2, 2], &[1, 0]).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        Ok(())
    }

    #[test]
    fn test_delete_missing_is_not_found() -> Result<()> {
        let maps = MemoryMaps::new();
        let map = maps.open_or_create(&spec("/l1", 1))?;
        assert!(map.delete(&[9, 9, 9, 9]).unwrap_err().is_not_found());
        Ok(())
    }
}
