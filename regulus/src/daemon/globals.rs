use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use regulus_common::globals::{
    G1_MAX_KEYS, G1Key, G1Value, G2_MAX_KEYS, G2Key, G2Value, G3_MAX_KEYS, G3Key, G3Value,
};
use regulus_common::MapKey;
use tracing::info;

use crate::bpf::{MapHandle, MapProvider};
use crate::endpoint::Mac;
use crate::{Error, Result};

/// Value that removes a G2 entry instead of inserting it.
pub const G2_DELETE: &str = "delete";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GlobalMap {
    G1,
    G2,
    G3,
}

impl FromStr for GlobalMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g1" => Ok(GlobalMap::G1),
            "g2" => Ok(GlobalMap::G2),
            "g3" => Ok(GlobalMap::G3),
            other => Err(Error::Validation(format!("unknown global map {other:?}"))),
        }
    }
}

impl Display for GlobalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalMap::G1 => write!(f, "G1"),
            GlobalMap::G2 => write!(f, "G2"),
            GlobalMap::G3 => write!(f, "G3"),
        }
    }
}

/// The node-wide maps, owned by the daemon and opened lazily.
#[derive(Debug)]
pub struct GlobalMaps {
    g1: MapHandle<G1Key>,
    g2: MapHandle<G2Key>,
    g3: MapHandle<G3Key>,
}

impl GlobalMaps {
    pub fn new(provider: Arc<dyn MapProvider>, globals_dir: &Path) -> Self {
        Self {
            g1: MapHandle::new(provider.clone(), globals_dir.join("regulus_g1"), G1_MAX_KEYS),
            g2: MapHandle::new(provider.clone(), globals_dir.join("regulus_g2"), G2_MAX_KEYS),
            g3: MapHandle::new(provider, globals_dir.join("regulus_g3"), G3_MAX_KEYS),
        }
    }

    pub fn open_all(&self) -> Result<()> {
        for (name, open) in [
            (GlobalMap::G1, self.g1.open_or_create().map(|_| ())),
            (GlobalMap::G2, self.g2.open_or_create().map(|_| ())),
            (GlobalMap::G3, self.g3.open_or_create().map(|_| ())),
        ] {
            open.map_err(|e| Error::Resource(format!("could not open {name} map: {e}")))?;
            info!(map = %name, "global map ready");
        }
        Ok(())
    }

    pub fn g1(&self) -> &MapHandle<G1Key> {
        &self.g1
    }

    pub fn g2(&self) -> &MapHandle<G2Key> {
        &self.g2
    }

    pub fn g3(&self) -> &MapHandle<G3Key> {
        &self.g3
    }

    /// Inserts or overwrites one entry from its text form:
    /// G1 `id=MAC`, G2 `IPv4=<anything>` (or `IPv4=delete`), G3 `IPv4=count`.
    pub fn update(&self, map: GlobalMap, key: &str, value: &str) -> Result<()> {
        match map {
            GlobalMap::G1 => {
                let key = parse_g1_key(key)?;
                let mac = Mac::from_str(value.trim())?;
                let value = G1Value::new(key.id as u16, mac.0);
                if let Some(old) = self.g1.lookup(&key)? {
                    info!(key = %key, old = %old, new = %value, "replacing G1 entry");
                }
                self.g1.update(&key, &value)
            }
            GlobalMap::G2 => {
                let key = G2Key::from(parse_ipv4(key)?);
                if value.trim() == G2_DELETE {
                    return self.g2.delete(&key);
                }
                self.g2.update(&key, &G2Value::new(key))
            }
            GlobalMap::G3 => {
                let key = G3Key {
                    address: parse_ipv4(key)?.into(),
                };
                let count = u16::from_str(value.trim())
                    .map_err(|e| Error::Validation(format!("invalid count {value}: {e}")))?;
                let mut entry: G3Value = key.new_value();
                entry.count = count;
                self.g3.update(&key, &entry)
            }
        }
    }

    pub fn delete(&self, map: GlobalMap, key: &str) -> Result<()> {
        match map {
            GlobalMap::G1 => self.g1.delete(&parse_g1_key(key)?),
            GlobalMap::G2 => self.g2.delete(&G2Key::from(parse_ipv4(key)?)),
            GlobalMap::G3 => self.g3.delete(&G3Key {
                address: parse_ipv4(key)?.into(),
            }),
        }
    }

    pub fn dump(&self, map: GlobalMap) -> Result<String> {
        match map {
            GlobalMap::G1 => self.g1.dump_to_string(),
            GlobalMap::G2 => self.g2.dump_to_string(),
            GlobalMap::G3 => self.g3.dump_to_string(),
        }
    }
}

fn parse_g1_key(key: &str) -> Result<G1Key> {
    let id = u16::from_str(key.trim())
        .map_err(|e| Error::Validation(format!("invalid G1 key {key}: {e}")))?;
    Ok(G1Key { id: id.into() })
}

fn parse_ipv4(key: &str) -> Result<Ipv4Addr> {
    Ipv4Addr::from_str(key.trim())
        .map_err(|e| Error::Validation(format!("invalid IPv4 key {key}: {e}")))
}
