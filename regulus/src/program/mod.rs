pub mod l1;
pub mod loader;

use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bpf::MapProvider;
use crate::endpoint::{Endpoint, Mac};
use crate::program::l1::L1Program;
use crate::program::loader::ProgramLoader;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgramKind {
    L1,
}

impl FromStr for ProgramKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "L1" | "l1" => Ok(ProgramKind::L1),
            "" => Err(Error::Validation("program type must be set".into())),
            other => Err(Error::Validation(format!("unknown program type {other:?}"))),
        }
    }
}

impl Display for ProgramKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramKind::L1 => write!(f, "L1"),
        }
    }
}

/// Snapshot of the endpoint a program is generated for.
#[derive(Clone, Debug)]
pub struct ProgramConf {
    pub container_id: String,
    pub host_ifindex: u32,
    pub host_mac: Mac,
    pub mac: Mac,
    pub ipv4: Option<Ipv4Addr>,
    pub lib_dir: PathBuf,
    pub run_dir: PathBuf,
    /// Where per-endpoint maps are pinned.
    pub globals_dir: PathBuf,
}

impl ProgramConf {
    pub fn from_endpoint(
        ep: &Endpoint,
        lib_dir: PathBuf,
        run_dir: PathBuf,
        globals_dir: PathBuf,
    ) -> Result<Self> {
        let container_id = ep.container_id.clone().ok_or_else(|| {
            Error::Validation(format!("endpoint {} has no container id", ep.name()))
        })?;
        Ok(Self {
            container_id,
            host_ifindex: ep.host_ifindex,
            host_mac: ep.host_mac,
            mac: ep.mac,
            ipv4: ep.ipv4,
            lib_dir,
            run_dir,
            globals_dir,
        })
    }

    /// Generated artifacts for this endpoint live here.
    pub fn endpoint_run_dir(&self) -> PathBuf {
        self.run_dir.join(&self.container_id)
    }
}

/// A program bound to one endpoint, together with the map it owns.
#[derive(Debug)]
pub enum Program {
    L1(L1Program),
}

impl Program {
    pub fn new(kind: ProgramKind, conf: ProgramConf, provider: Arc<dyn MapProvider>) -> Self {
        match kind {
            ProgramKind::L1 => Program::L1(L1Program::new(conf, provider)),
        }
    }

    pub fn kind(&self) -> ProgramKind {
        match self {
            Program::L1(_) => ProgramKind::L1,
        }
    }

    pub async fn start(&self, options: &str, loader: &dyn ProgramLoader) -> Result<()> {
        match self {
            Program::L1(p) => p.start(options, loader).await,
        }
    }

    pub fn stop(&self, options: &str) -> Result<()> {
        match self {
            Program::L1(p) => p.stop(options),
        }
    }

    pub fn update_element(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Program::L1(p) => p.update_element(key, value),
        }
    }

    pub fn delete_element(&self, key: &str) -> Result<()> {
        match self {
            Program::L1(p) => p.delete_element(key),
        }
    }

    /// Textual value stored under `key`, or `None`.
    pub fn lookup_element(&self, key: &str) -> Result<Option<String>> {
        match self {
            Program::L1(p) => Ok(p.lookup_element(key)?.map(|v| v.to_string())),
        }
    }

    pub fn dump(&self) -> Result<String> {
        match self {
            Program::L1(p) => p.dump(),
        }
    }
}

/// Splits `key=value` on the first `=`. Both sides must be non-empty.
pub fn parse_kv_arg(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
            Ok((k.trim().to_string(), v.trim().to_string()))
        }
        _ => Err(Error::Validation(format!(
            "expected key=value, received {arg:?}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_program_kind() -> Result<()> {
        assert_eq!(ProgramKind::from_str("L1")?, ProgramKind::L1);
        assert_eq!(ProgramKind::L1.to_string(), "L1");
        assert!(matches!(
            ProgramKind::from_str("L7"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(ProgramKind::from_str(""), Err(Error::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_parse_kv_arg() -> Result<()> {
        assert_eq!(
            parse_kv_arg("10.0.0.5=3")?,
            ("10.0.0.5".to_string(), "3".to_string())
        );
        assert_eq!(parse_kv_arg("a=b=c")?, ("a".to_string(), "b=c".to_string()));
        assert!(parse_kv_arg("10.0.0.5").is_err());
        assert!(parse_kv_arg("=3").is_err());
        Ok(())
    }

    #[test]
    fn test_conf_requires_container_id() {
        let ep = Endpoint::new(None, Some("e1".into()));
        let res = ProgramConf::from_endpoint(&ep, "/lib".into(), "/run".into(), "/bpf".into());
        assert!(matches!(res, Err(Error::Validation(_))));
    }
}
