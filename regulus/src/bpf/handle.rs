use std::fmt::{Debug, Display, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use regulus_common::{MapKey, MapRecord};
use tracing::debug;

use crate::bpf::{BpfMap, MapProvider, MapSpec, hex_dump};
use crate::{Error, Result};

/// Typed access to one kernel hash map.
///
/// The backing map is opened on first use. Every record crosses the
/// boundary through `MapRecord::convert`, so callers never swap bytes.
pub struct MapHandle<K: MapKey> {
    spec: MapSpec,
    provider: Arc<dyn MapProvider>,
    map: Mutex<Option<Arc<dyn BpfMap>>>,
    _key: PhantomData<fn() -> K>,
}

impl<K: MapKey> Debug for MapHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHandle")
            .field("path", &self.spec.path)
            .field("max_entries", &self.spec.max_entries)
            .finish()
    }
}

impl<K: MapKey> MapHandle<K> {
    pub fn new(provider: Arc<dyn MapProvider>, path: impl AsRef<Path>, max_entries: u32) -> Self {
        Self {
            spec: MapSpec::new(path.as_ref(), K::SIZE, K::Value::SIZE, max_entries),
            provider,
            map: Mutex::new(None),
            _key: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    pub fn is_open(&self) -> bool {
        self.map.lock().is_some()
    }

    /// Idempotent. Only the open step is serialized; map operations are not.
    pub fn open_or_create(&self) -> Result<Arc<dyn BpfMap>> {
        let mut guard = self.map.lock();
        if let Some(map) = guard.as_ref() {
            return Ok(map.clone());
        }
        let map = self.provider.open_or_create(&self.spec)?;
        debug!(path = %self.spec.path.display(), "map handle opened");
        *guard = Some(map.clone());
        Ok(map)
    }

    pub fn update(&self, key: &K, value: &K::Value) -> Result<()> {
        let map = self.open_or_create()?;
        map.update(&encode(key)?, &encode(value)?)
    }

    pub fn lookup(&self, key: &K) -> Result<Option<K::Value>> {
        let map = self.open_or_create()?;
        match map.get(&encode(key)?)? {
            Some(raw) => Ok(Some(decode::<K::Value>(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &K) -> Result<()> {
        let map = self.open_or_create()?;
        map.delete(&encode(key)?).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!(
                "entry in map {}",
                self.spec.path.display()
            )),
            e => e,
        })
    }

    /// Visits every live entry with its raw key and value bytes. Iteration
    /// order is unspecified. A visitor error stops the walk.
    pub fn dump<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let map = self.open_or_create()?;
        for (key, value) in map.get_state()? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(K, K::Value)>> {
        let mut out = Vec::new();
        self.dump(|key, value| {
            out.push((decode::<K>(key)?, decode::<K::Value>(value)?));
            Ok(())
        })?;
        Ok(out)
    }
}

impl<K> MapHandle<K>
where
    K: MapKey + Display,
    K::Value: Display,
{
    pub fn dump_to_string(&self) -> Result<String> {
        let mut out = String::new();
        self.dump(|key, value| {
            let k = decode::<K>(key)?;
            let v = decode::<K::Value>(value)?;
            let _ = writeln!(out, "{k} => {v}");
            let _ = write!(out, "Key:\n{}Value:\n{}", hex_dump(key), hex_dump(value));
            Ok(())
        })?;
        Ok(out)
    }
}

fn encode<R: MapRecord>(record: &R) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; R::SIZE];
    record.convert().encode(&mut buf)?;
    Ok(buf)
}

fn decode<R: MapRecord>(raw: &[u8]) -> Result<R> {
    Ok(R::decode(raw)?.convert())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use regulus_common::globals::{G2Key, G2Value};
    use regulus_common::l1::{L1Key, L1Value};

    use super::*;
    use crate::bpf::MemoryMaps;

    fn l1_handle(provider: Arc<dyn MapProvider>) -> MapHandle<L1Key> {
        MapHandle::new(provider, "/sys/fs/bpf/tc/globals/ep_l1_c1", 4)
    }

    fn l1_key(ip: [u8; 4]) -> L1Key {
        L1Key {
            address: Ipv4Addr::from(ip).into(),
        }
    }

    #[test]
    fn test_update_then_lookup() -> Result<()> {
        let handle = l1_handle(Arc::new(MemoryMaps::new()));
        assert!(!handle.is_open());
        let value = L1Value {
            tx_count: 3,
            rx_count: 3,
        };
        handle.update(&l1_key([10, 0, 0, 5]), &value)?;
        assert!(handle.is_open());
        assert_eq!(handle.lookup(&l1_key([10, 0, 0, 5]))?, Some(value));
        assert_eq!(handle.lookup(&l1_key([10, 0, 0, 6]))?, None);
        Ok(())
    }

    #[test]
    fn test_delete_then_lookup() -> Result<()> {
        let handle = l1_handle(Arc::new(MemoryMaps::new()));
        let key = l1_key([10, 0, 0, 5]);
        handle.update(&key, &L1Value::default())?;
        handle.delete(&key)?;
        assert_eq!(handle.lookup(&key)?, None);
        assert!(handle.delete(&key).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_converted_key_reaches_map_in_network_order() -> Result<()> {
        let provider = Arc::new(MemoryMaps::new());
        let handle: MapHandle<G2Key> =
            MapHandle::new(provider.clone(), "/sys/fs/bpf/tc/globals/regulus_g2", 16);
        let key = G2Key::from(Ipv4Addr::new(10, 0, 0, 9));
        handle.update(&key, &G2Value::new(key))?;

        let mut raw_keys = Vec::new();
        handle.dump(|k, _| {
            raw_keys.push(k.to_vec());
            Ok(())
        })?;
        assert_eq!(raw_keys, vec![vec![10, 0, 0, 9]]);

        let entries = handle.entries()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, key);
        assert_eq!(entries[0].1.id, key.address);
        Ok(())
    }

    #[test]
    fn test_visitor_error_aborts_dump() -> Result<()> {
        let handle = l1_handle(Arc::new(MemoryMaps::new()));
        handle.update(&l1_key([10, 0, 0, 1]), &L1Value::default())?;
        handle.update(&l1_key([10, 0, 0, 2]), &L1Value::default())?;
        let mut visited = 0;
        let res = handle.dump(|_, _| {
            visited += 1;
            Err(Error::Validation("stop".into()))
        });
        assert!(matches!(res, Err(Error::Validation(_))));
        assert_eq!(visited, 1);
        Ok(())
    }

    #[test]
    fn test_dump_to_string() -> Result<()> {
        let handle = l1_handle(Arc::new(MemoryMaps::new()));
        handle.update(
            &l1_key([10, 0, 0, 5]),
            &L1Value {
                tx_count: 1,
                rx_count: 1,
            },
        )?;
        let dump = handle.dump_to_string()?;
        assert!(dump.starts_with("10.0.0.5 => tx=1 rx=1\nKey:\n00000000  0a 00 00 05"));
        assert!(dump.contains("Value:\n"));
        Ok(())
    }

    #[test]
    fn test_table_full_is_resource_error() -> Result<()> {
        let handle = l1_handle(Arc::new(MemoryMaps::new()));
        for i in 1..=4 {
            handle.update(&l1_key([10, 0, 0, i]), &L1Value::default())?;
        }
        let err = handle
            .update(&l1_key([10, 0, 0, 9]), &L1Value::default())
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        Ok(())
    }
}
