use std::fmt::Write;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use regulus_common::MapKey;
use regulus_common::l1::{L1_MAX_KEYS, L1Key, L1Value};
use tracing::{info, warn};

use crate::bpf::{MapHandle, MapProvider};
use crate::program::ProgramConf;
use crate::program::loader::{LoadRequest, ProgramLoader, write_artifact};
use crate::{Error, Result};

pub const L1_MAP_PREFIX: &str = "ep_l1_";
pub const L1_HEADER: &str = "l1.h";
const L1_SCRIPT: &str = "networking/l1/init.sh";

/// Per-endpoint traffic counter keyed by peer address.
#[derive(Debug)]
pub struct L1Program {
    conf: ProgramConf,
    map: MapHandle<L1Key>,
    started: AtomicBool,
}

impl L1Program {
    pub fn new(conf: ProgramConf, provider: Arc<dyn MapProvider>) -> Self {
        let path = conf
            .globals_dir
            .join(format!("{L1_MAP_PREFIX}{}", conf.container_id));
        Self {
            map: MapHandle::new(provider, path, L1_MAX_KEYS),
            conf,
            started: AtomicBool::new(false),
        }
    }

    pub fn map(&self) -> &MapHandle<L1Key> {
        &self.map
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub async fn start(&self, options: &str, loader: &dyn ProgramLoader) -> Result<()> {
        validate_options(options)?;
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyExists(format!(
                "L1 program for container {}",
                self.conf.container_id
            )));
        }
        if let Err(e) = self.attach(options, loader).await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!(container_id = %self.conf.container_id, "L1 program started");
        Ok(())
    }

    async fn attach(&self, options: &str, loader: &dyn ProgramLoader) -> Result<()> {
        let run_dir = self.conf.endpoint_run_dir();
        write_artifact(&run_dir.join(L1_HEADER), &self.header()?).await?;
        self.map.open_or_create()?;
        let device = loader.interface_name(self.conf.host_ifindex)?;
        let request = LoadRequest {
            script: self.conf.lib_dir.join(L1_SCRIPT),
            lib_dir: self.conf.lib_dir.clone(),
            run_dir,
            mode: "direct".into(),
            device: Some(device),
            options: (!options.is_empty()).then(|| options.to_string()),
        };
        loader.load(&request).await
    }

    /// Release of the kernel program and map is not done yet; only the
    /// options are checked.
    pub fn stop(&self, options: &str) -> Result<()> {
        validate_options(options)?;
        if !self.started.swap(false, Ordering::AcqRel) {
            warn!(container_id = %self.conf.container_id, "stopping L1 program that was not started");
        }
        Ok(())
    }

    /// `key` is an IPv4 address, `value` a decimal count applied to both
    /// directions.
    pub fn update_element(&self, key: &str, value: &str) -> Result<()> {
        let key = parse_key(key)?;
        let count = u16::from_str(value.trim())
            .map_err(|e| Error::Validation(format!("invalid count {value}: {e}")))?;
        let mut entry = key.new_value();
        entry.tx_count = count;
        entry.rx_count = count;
        self.map.update(&key, &entry)
    }

    pub fn delete_element(&self, key: &str) -> Result<()> {
        self.map.delete(&parse_key(key)?)
    }

    pub fn lookup_element(&self, key: &str) -> Result<Option<L1Value>> {
        self.map.lookup(&parse_key(key)?)
    }

    pub fn dump(&self) -> Result<String> {
        self.map.dump_to_string()
    }

    pub fn header(&self) -> Result<String> {
        let conf = &self.conf;
        let ip = conf.ipv4.ok_or_else(|| {
            Error::Validation(format!("endpoint {} has no IPv4 address", conf.container_id))
        })?;
        let octets = ip.octets();
        let map_name = format!("{L1_MAP_PREFIX}{}", conf.container_id);

        let mut out = String::new();
        let _ = write!(
            out,
            "/*\n \
             * Docker Container ID: {}\n \
             * Map Name: {map_name}\n \
             * MAC: {}\n \
             * IPv4 address: {ip}\n \
             * Host Side MAC: {}\n \
             * Host Side Interface Index: {}\n \
             */\n\n",
            conf.container_id, conf.mac, conf.host_mac, conf.host_ifindex
        );
        let _ = writeln!(out, "#define DOCKER_ID {}", conf.container_id);
        let _ = writeln!(out, "#define MAP_NAME {map_name}");
        out.push_str(&define_address("CONTAINER_MAC", &conf.mac.0));
        out.push_str(&define_address("CONTAINER_IP_ARRAY", &octets));
        let _ = writeln!(
            out,
            "#define CONTAINER_IP_BIGENDIAN {:#x}",
            u32::from_be_bytes(octets)
        );
        let _ = writeln!(out, "#define CONTAINER_IP {:#x}", u32::from_le_bytes(octets));
        out.push_str(&define_address("CONTAINER_HOST_SIDE_MAC", &conf.host_mac.0));
        let _ = writeln!(
            out,
            "#define CONTAINER_HOST_SIDE_IFC_IDX {}",
            conf.host_ifindex
        );
        out.push('\n');
        Ok(out)
    }
}

/// Accepts an empty string, `ingress`, `egress` or both comma separated.
pub fn validate_options(options: &str) -> Result<()> {
    let options = options.trim();
    if options.is_empty() {
        return Ok(());
    }
    let mut seen = Vec::with_capacity(2);
    for part in options.split(',').map(str::trim) {
        if !matches!(part, "ingress" | "egress") || seen.contains(&part) {
            return Err(Error::Validation(format!(
                "invalid L1 options {options}, expected ingress, egress or ingress,egress"
            )));
        }
        seen.push(part);
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<L1Key> {
    let ip = Ipv4Addr::from_str(key.trim())
        .map_err(|e| Error::Validation(format!("invalid key {key}: {e}")))?;
    Ok(L1Key { address: ip.into() })
}

fn define_address(name: &str, bytes: &[u8]) -> String {
    let parts: Vec<String> = bytes.iter().map(|b| format!("{b:#x}")).collect();
    format!("#define {name} {{ .addr = {{ {} }} }}\n", parts.join(", "))
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::bpf::MemoryMaps;
    use crate::endpoint::Mac;
    use crate::program::loader::RecordingLoader;

    fn conf(run_dir: PathBuf) -> ProgramConf {
        ProgramConf {
            container_id: "c1".into(),
            host_ifindex: 36,
            host_mac: Mac([0x1e, 0x0c, 0x15, 0x53, 0x92, 0x23]),
            mac: Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            ipv4: Some(Ipv4Addr::new(10, 255, 1, 34)),
            lib_dir: "/usr/lib/regulus".into(),
            run_dir,
            globals_dir: "/sys/fs/bpf/tc/globals".into(),
        }
    }

    #[test]
    fn test_validate_options() {
        for ok in ["", "ingress", "egress", "ingress,egress", "egress, ingress"] {
            assert!(validate_options(ok).is_ok(), "{ok}");
        }
        for bad in ["both", "ingress,ingress", "ingress,", "tx"] {
            assert!(validate_options(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_header_contents() -> Result<()> {
        let program = L1Program::new(conf("/var/run/regulus".into()), Arc::new(MemoryMaps::new()));
        let header = program.header()?;
        assert!(header.starts_with("/*\n * Docker Container ID: c1\n * Map Name: ep_l1_c1\n"));
        assert!(header.contains("#define MAP_NAME ep_l1_c1\n"));
        assert!(header.contains("#define CONTAINER_IP_ARRAY { .addr = { 0xa, 0xff, 0x1, 0x22 } }\n"));
        assert!(header.contains("#define CONTAINER_IP_BIGENDIAN 0xaff0122\n"));
        assert!(header.contains("#define CONTAINER_IP 0x2201ff0a\n"));
        assert!(header.contains(
            "#define CONTAINER_HOST_SIDE_MAC { .addr = { 0x1e, 0xc, 0x15, 0x53, 0x92, 0x23 } }\n"
        ));
        assert!(header.contains("#define CONTAINER_HOST_SIDE_IFC_IDX 36\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_writes_header_and_loads_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let program = L1Program::new(conf(dir.path().into()), Arc::new(MemoryMaps::new()));
        let loader = RecordingLoader::default();

        program.start("ingress", &loader).await?;
        assert!(program.is_started());
        assert!(program.map().is_open());
        assert!(dir.path().join("c1").join(L1_HEADER).exists());

        let err = program.start("ingress", &loader).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let requests = loader.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].device.as_deref(), Some("veth36"));
        assert_eq!(
            requests[0].script,
            PathBuf::from("/usr/lib/regulus/networking/l1/init.sh")
        );
        assert_eq!(requests[0].run_dir, dir.path().join("c1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_options_do_not_start() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let program = L1Program::new(conf(dir.path().into()), Arc::new(MemoryMaps::new()));
        let loader = RecordingLoader::default();
        assert!(program.start("sideways", &loader).await.is_err());
        assert!(!program.is_started());
        assert!(loader.requests.lock().is_empty());
        assert!(program.stop("sideways").is_err());
        assert!(program.stop("").is_ok());
        Ok(())
    }

    #[test]
    fn test_element_operations() -> Result<()> {
        let program = L1Program::new(conf("/var/run/regulus".into()), Arc::new(MemoryMaps::new()));
        program.update_element("10.0.0.5", "7")?;
        let value = program.lookup_element("10.0.0.5")?.unwrap();
        assert_eq!((value.tx_count, value.rx_count), (7, 7));

        assert!(matches!(
            program.update_element("10.0.0.5", "70000"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            program.update_element("not-an-ip", "1"),
            Err(Error::Validation(_))
        ));

        assert!(program.dump()?.starts_with("10.0.0.5 => tx=7 rx=7"));
        program.delete_element("10.0.0.5")?;
        assert!(program.delete_element("10.0.0.5").unwrap_err().is_not_found());
        assert_eq!(program.lookup_element("10.0.0.5")?, None);
        Ok(())
    }
}
