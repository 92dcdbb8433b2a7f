use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::{Error, Result};

/// Arguments handed to an `init.sh` that compiles and attaches a program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadRequest {
    pub script: PathBuf,
    pub lib_dir: PathBuf,
    pub run_dir: PathBuf,
    /// `direct` or the tunnel name.
    pub mode: String,
    pub device: Option<String>,
    pub options: Option<String>,
}

impl LoadRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.lib_dir.display().to_string(),
            self.run_dir.display().to_string(),
            self.mode.clone(),
        ];
        if let Some(device) = self.device.as_ref() {
            args.push(device.clone());
        }
        if let Some(opts) = self.options.as_ref() {
            args.push(opts.clone());
        }
        args
    }
}

/// Compiles and attaches kernel programs. The daemon never does this itself.
pub trait ProgramLoader: Send + Sync {
    fn load<'a>(&'a self, request: &'a LoadRequest) -> BoxFuture<'a, Result<()>>;

    fn interface_name(&self, ifindex: u32) -> Result<String>;
}

/// Runs the request's script and captures its combined output on failure.
#[derive(Clone, Debug)]
pub struct ScriptLoader {
    sys_class_net: PathBuf,
}

impl Default for ScriptLoader {
    fn default() -> Self {
        Self {
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl ScriptLoader {
    pub fn with_sys_class_net(path: impl Into<PathBuf>) -> Self {
        Self {
            sys_class_net: path.into(),
        }
    }
}

impl ProgramLoader for ScriptLoader {
    fn load<'a>(&'a self, request: &'a LoadRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = request.args();
            info!(script = %request.script.display(), args = ?args, "running program loader");
            let output = tokio::process::Command::new(&request.script)
                .args(&args)
                .stdin(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                return Err(Error::Loader {
                    script: format!("{} {}", request.script.display(), args.join(" ")),
                    output: combined,
                });
            }
            debug!(script = %request.script.display(), "program loader finished");
            Ok(())
        })
    }

    fn interface_name(&self, ifindex: u32) -> Result<String> {
        for entry in std::fs::read_dir(&self.sys_class_net)? {
            let entry = entry?;
            let Ok(raw) = std::fs::read_to_string(entry.path().join("ifindex")) else {
                continue;
            };
            if raw.trim().parse::<u32>().ok() == Some(ifindex) {
                return Ok(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(Error::NotFound(format!("interface with index {ifindex}")))
    }
}

/// Loader for dry runs: records nothing, attaches nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLoader;

impl ProgramLoader for NoopLoader {
    fn load<'a>(&'a self, request: &'a LoadRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(script = %request.script.display(), args = ?request.args(), "dry run, skipping program load");
            Ok(())
        })
    }

    fn interface_name(&self, ifindex: u32) -> Result<String> {
        Ok(format!("if{ifindex}"))
    }
}

/// Writes a generated header to a uniquely named file next to its final
/// path, syncs it and renames it into place.
pub async fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    let target = path.to_path_buf();
    let contents = contents.to_owned();
    tokio::task::spawn_blocking(move || persist_artifact(&target, &contents)).await??;
    debug!(path = %path.display(), "wrote artifact");
    Ok(())
}

fn persist_artifact(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Loader that records every request and attaches nothing.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingLoader {
    pub requests: parking_lot::Mutex<Vec<LoadRequest>>,
}

#[cfg(test)]
impl ProgramLoader for RecordingLoader {
    fn load<'a>(&'a self, request: &'a LoadRequest) -> BoxFuture<'a, Result<()>> {
        self.requests.lock().push(request.clone());
        Box::pin(async { Ok(()) })
    }

    fn interface_name(&self, ifindex: u32) -> Result<String> {
        Ok(format!("veth{ifindex}"))
    }
}
