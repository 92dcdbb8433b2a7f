mod registry;
mod status;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

pub use registry::EndpointRegistry;
pub use status::{STATUS_HISTORY_CAPACITY, StatusCode, StatusEntry, StatusHistory};

use crate::options::BoolOptions;
use crate::program::{Program, ProgramKind};
use crate::{Error, Result, deserialize_from_str, serialize_to_string};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for Mac {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::Validation(format!("invalid MAC address {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Validation(format!("invalid MAC address {s}")))?;
        }
        if parts.next().is_some() {
            return Err(Error::Validation(format!("invalid MAC address {s}")));
        }
        Ok(Mac(out))
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serialize_to_string(self, serializer)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        deserialize_from_str(deserializer)
    }
}

/// The network identity of one workload.
///
/// `container_id` and `plugin_endpoint_id` are fill-only: once set they are
/// never cleared or replaced.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Endpoint {
    pub container_id: Option<String>,
    pub plugin_endpoint_id: Option<String>,
    pub plugin_network_id: Option<String>,
    pub ifname: String,
    pub mac: Mac,
    pub ipv4: Option<Ipv4Addr>,
    pub host_ifindex: u32,
    pub host_mac: Mac,
    pub node_ipv4: Option<Ipv4Addr>,
    pub options: BoolOptions,
    #[serde(serialize_with = "serialize_program_kinds")]
    pub programs: BTreeMap<ProgramKind, Arc<Program>>,
    pub status: StatusHistory,
}

/// Registration sent by the network plugin or the container runtime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub container_id: Option<String>,
    pub plugin_endpoint_id: Option<String>,
    pub plugin_network_id: Option<String>,
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub mac: Mac,
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub host_ifindex: u32,
    #[serde(default)]
    pub host_mac: Mac,
    pub node_ipv4: Option<Ipv4Addr>,
}

impl TryFrom<EndpointRequest> for Endpoint {
    type Error = Error;

    fn try_from(req: EndpointRequest) -> Result<Self> {
        let container_id = req.container_id.filter(|id| !id.is_empty());
        let plugin_endpoint_id = req.plugin_endpoint_id.filter(|id| !id.is_empty());
        if container_id.is_none() && plugin_endpoint_id.is_none() {
            return Err(Error::Validation(
                "endpoint requires a container id or a plugin endpoint id".into(),
            ));
        }
        Ok(Self {
            container_id,
            plugin_endpoint_id,
            plugin_network_id: req.plugin_network_id.filter(|id| !id.is_empty()),
            ifname: req.ifname,
            mac: req.mac,
            ipv4: req.ipv4,
            host_ifindex: req.host_ifindex,
            host_mac: req.host_mac,
            node_ipv4: req.node_ipv4,
            ..Default::default()
        })
    }
}

impl Endpoint {
    pub fn new(container_id: Option<String>, plugin_endpoint_id: Option<String>) -> Self {
        Self {
            container_id,
            plugin_endpoint_id,
            ..Default::default()
        }
    }

    /// Human readable handle for logs.
    pub fn name(&self) -> &str {
        self.container_id
            .as_deref()
            .or(self.plugin_endpoint_id.as_deref())
            .unwrap_or_default()
    }

    pub fn fill_container_id(&mut self, id: Option<&str>) -> bool {
        fill(&mut self.container_id, id)
    }

    pub fn fill_plugin_endpoint_id(&mut self, id: Option<&str>) -> bool {
        fill(&mut self.plugin_endpoint_id, id)
    }

    /// Merges a later registration of the same endpoint. Identifiers are
    /// only filled in. Addressing is taken from `other` where it is set.
    pub fn merge_from(&mut self, other: &Endpoint) {
        self.fill_container_id(other.container_id.as_deref());
        self.fill_plugin_endpoint_id(other.plugin_endpoint_id.as_deref());
        fill(&mut self.plugin_network_id, other.plugin_network_id.as_deref());
        if !other.ifname.is_empty() {
            self.ifname.clone_from(&other.ifname);
        }
        if !other.mac.is_zero() {
            self.mac = other.mac;
        }
        if other.ipv4.is_some() {
            self.ipv4 = other.ipv4;
        }
        if other.host_ifindex != 0 {
            self.host_ifindex = other.host_ifindex;
        }
        if !other.host_mac.is_zero() {
            self.host_mac = other.host_mac;
        }
        if other.node_ipv4.is_some() {
            self.node_ipv4 = other.node_ipv4;
        }
        for (name, value) in other.options.iter() {
            self.options.set(name.clone(), *value);
        }
    }

    pub fn log_status(&self, code: StatusCode, message: impl Into<String>) {
        self.status.log(code, message);
    }
}

fn fill(slot: &mut Option<String>, value: Option<&str>) -> bool {
    match (slot.as_ref(), value) {
        (None, Some(v)) if !v.is_empty() => {
            *slot = Some(v.to_string());
            true
        }
        _ => false,
    }
}

fn serialize_program_kinds<S: Serializer>(
    programs: &BTreeMap<ProgramKind, Arc<Program>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    programs
        .keys()
        .map(|k| k.to_string())
        .collect::<Vec<String>>()
        .serialize(serializer)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mac_parse() -> Result<()> {
        let mac = Mac::from_str("AA:bb:cc:dd:ee:0f")?;
        assert_eq!(mac.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");
        assert!(Mac::from_str("aa:bb:cc:dd:ee").is_err());
        assert!(Mac::from_str("aa:bb:cc:dd:ee:ff:00").is_err());
        assert!(Mac::from_str("zz:bb:cc:dd:ee:ff").is_err());
        Ok(())
    }

    #[test]
    fn test_fill_never_overwrites() {
        let mut ep = Endpoint::new(Some("c1".into()), None);
        assert!(!ep.fill_container_id(Some("c2")));
        assert!(!ep.fill_plugin_endpoint_id(Some("")));
        assert!(ep.fill_plugin_endpoint_id(Some("e1")));
        assert!(!ep.fill_plugin_endpoint_id(None));
        assert_eq!(ep.container_id.as_deref(), Some("c1"));
        assert_eq!(ep.plugin_endpoint_id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_request_requires_an_identifier() {
        let req = EndpointRequest {
            container_id: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            Endpoint::try_from(req),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_serialize_endpoint() -> Result<()> {
        let mut ep = Endpoint::new(Some("c1".into()), Some("e1".into()));
        ep.mac = Mac::from_str("aa:bb:cc:dd:ee:ff")?;
        ep.ipv4 = Some(Ipv4Addr::new(10, 0, 0, 5));
        ep.status.log_ok("created");
        let value = serde_json::to_value(&ep)?;
        assert_eq!(value["mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(value["ipv4"], "10.0.0.5");
        assert_eq!(value["status"][0]["message"], "created");
        assert_eq!(value["programs"], serde_json::json!([]));
        Ok(())
    }
}
