pub mod binding;
pub mod globals;
pub mod watcher;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bpf::{MapProvider, globals_dir};
use crate::config::Config;
use crate::daemon::binding::{BindOutcome, wait_for_match};
use crate::daemon::globals::{GlobalMap, GlobalMaps};
use crate::daemon::watcher::ContainerInfo;
use crate::endpoint::{Endpoint, EndpointRegistry, EndpointRequest, StatusCode};
use crate::metrics::DaemonMetrics;
use crate::options::{self, BoolOptions, DAEMON_OPTIONS};
use crate::program::loader::{LoadRequest, ProgramLoader, write_artifact};
use crate::program::{Program, ProgramConf, ProgramKind, parse_kv_arg};
use crate::{Error, Result};

pub const NETDEV_HEADER: &str = "netdev_config.h";
pub const BASE_SCRIPT: &str = "init.sh";
const DIRECT_MODE: &str = "direct";

#[derive(Clone, Debug)]
struct TrackedContainer {
    info: ContainerInfo,
    bound: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PingResponse {
    pub node_name: Option<String>,
    pub node_address: Option<Ipv4Addr>,
    pub options: BoolOptions,
}

#[derive(Clone, Debug, Serialize)]
pub struct DaemonStatus {
    pub endpoints: usize,
    pub containers: usize,
    pub bound_containers: usize,
    pub mode: String,
    pub dry_run: bool,
    pub options: BoolOptions,
}

/// Owns every piece of node-local state: the endpoint registry, the
/// container tracking table, the global maps and the daemon options.
pub struct Daemon {
    config: Config,
    registry: EndpointRegistry,
    containers: RwLock<HashMap<String, TrackedContainer>>,
    globals: GlobalMaps,
    globals_dir: PathBuf,
    provider: Arc<dyn MapProvider>,
    loader: Arc<dyn ProgramLoader>,
    options: RwLock<BoolOptions>,
    metrics: DaemonMetrics,
}

impl Daemon {
    pub fn new(
        config: Config,
        provider: Arc<dyn MapProvider>,
        loader: Arc<dyn ProgramLoader>,
        metrics: DaemonMetrics,
    ) -> Self {
        let globals_dir = globals_dir(&config.bpf_fs);
        Self {
            globals: GlobalMaps::new(provider.clone(), &globals_dir),
            globals_dir,
            registry: EndpointRegistry::new(),
            containers: RwLock::new(HashMap::default()),
            options: RwLock::new(BoolOptions::default()),
            config,
            provider,
            loader,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn globals(&self) -> &GlobalMaps {
        &self.globals
    }

    /// Prepares the run directory, compiles the base program and opens the
    /// global maps. Any failure here is fatal.
    pub async fn init(&self) -> Result<()> {
        options::validate(DAEMON_OPTIONS, &self.config.options)?;
        self.options.write().apply(&self.config.options);
        let state_dir = self.config.run_dir.join("globals");
        tokio::fs::create_dir_all(&state_dir).await.map_err(|e| {
            Error::Resource(format!("could not create {}: {e}", state_dir.display()))
        })?;
        self.write_netdev_header().await?;
        if self.config.dry_run {
            info!("dry run, base program is not compiled");
        } else {
            self.compile_base().await?;
        }
        self.globals.open_all()?;
        info!(
            run_dir = %self.config.run_dir.display(),
            mode = self.mode(),
            "daemon initialized"
        );
        Ok(())
    }

    fn mode(&self) -> &str {
        self.config.tunnel.as_deref().unwrap_or(DIRECT_MODE)
    }

    async fn write_netdev_header(&self) -> Result<()> {
        let header = self.options.read().header_defines(DAEMON_OPTIONS);
        write_artifact(&self.config.run_dir.join(NETDEV_HEADER), &header).await
    }

    async fn compile_base(&self) -> Result<()> {
        let request = LoadRequest {
            script: self.config.lib_dir.join(BASE_SCRIPT),
            lib_dir: self.config.lib_dir.clone(),
            run_dir: self.config.run_dir.clone(),
            mode: self.mode().to_string(),
            device: self
                .config
                .tunnel
                .is_none()
                .then(|| self.config.device.clone()),
            options: None,
        };
        self.loader.load(&request).await
    }

    pub fn ping(&self) -> PingResponse {
        PingResponse {
            node_name: self.config.node_name.clone(),
            node_address: self.config.node_address,
            options: self.options.read().clone(),
        }
    }

    pub fn global_status(&self) -> DaemonStatus {
        let (containers, bound_containers) = {
            let containers = self.containers.read();
            (
                containers.len(),
                containers.values().filter(|c| c.bound).count(),
            )
        };
        DaemonStatus {
            endpoints: self.registry.len(),
            containers,
            bound_containers,
            mode: self.mode().to_string(),
            dry_run: self.config.dry_run,
            options: self.options.read().clone(),
        }
    }

    /// Validates and applies daemon option changes. When anything changed
    /// the header is rewritten and the base program recompiled; a failed
    /// recompile is only logged.
    pub async fn update_options(&self, changes: &BTreeMap<String, bool>) -> Result<usize> {
        options::validate(DAEMON_OPTIONS, changes)?;
        let changed = self.options.write().apply(changes);
        if changed == 0 {
            return Ok(0);
        }
        info!(changed, "daemon options updated");
        self.write_netdev_header().await?;
        if !self.config.dry_run
            && let Err(e) = self.compile_base().await
        {
            warn!(%e, "failed to recompile base program after option change");
        }
        Ok(changed)
    }

    pub fn endpoint_create(&self, request: EndpointRequest) -> Result<Endpoint> {
        let endpoint = Endpoint::try_from(request)?;
        let stored = self.registry.insert(endpoint)?;
        self.metrics.endpoints.set(self.registry.len() as i64);
        info!(endpoint = stored.name(), "endpoint created");
        Ok(stored)
    }

    pub fn endpoint_get_by_container_id(&self, container_id: &str) -> Result<Endpoint> {
        self.registry
            .get_by_container_id(container_id)
            .ok_or_else(|| Error::NotFound(format!("endpoint for container {container_id}")))
    }

    pub fn endpoint_get_by_plugin_endpoint_id(&self, id: &str) -> Result<Endpoint> {
        self.registry
            .get_by_plugin_endpoint_id(id)
            .ok_or_else(|| Error::NotFound(format!("endpoint {id}")))
    }

    pub fn endpoints_list(&self) -> Vec<Endpoint> {
        self.registry.list()
    }

    pub fn endpoint_update(
        &self,
        container_id: &str,
        changes: &BTreeMap<String, bool>,
    ) -> Result<Endpoint> {
        if let Some(name) = changes.keys().find(|name| name.trim().is_empty()) {
            return Err(Error::Validation(format!("invalid option name {name:?}")));
        }
        self.registry.update_options(container_id, changes)
    }

    pub fn endpoint_leave(&self, container_id: &str) -> Result<Endpoint> {
        let endpoint = self.registry.leave_by_container_id(container_id)?;
        self.release(&endpoint);
        Ok(endpoint)
    }

    pub fn endpoint_leave_by_plugin_endpoint_id(&self, id: &str) -> Result<Endpoint> {
        let endpoint = self.registry.leave_by_plugin_endpoint_id(id)?;
        self.release(&endpoint);
        Ok(endpoint)
    }

    fn release(&self, endpoint: &Endpoint) {
        for (kind, program) in &endpoint.programs {
            if let Err(e) = program.stop("") {
                warn!(endpoint = endpoint.name(), program = %kind, %e, "failed to stop program");
            }
        }
        self.metrics.endpoints.set(self.registry.len() as i64);
    }

    /// Builds and starts a program for the endpoint. The program's slot is
    /// reserved first so a second start of the same kind fails with
    /// `AlreadyExists`; a failed start frees the slot again.
    pub async fn program_start(
        &self,
        container_id: &str,
        kind: ProgramKind,
        options: &str,
    ) -> Result<()> {
        let program = self.registry.attach_program(container_id, kind, |ep| {
            let conf = ProgramConf::from_endpoint(
                ep,
                self.config.lib_dir.clone(),
                self.config.run_dir.clone(),
                self.globals_dir.clone(),
            )?;
            Ok(Program::new(kind, conf, self.provider.clone()))
        })?;

        match program.start(options, self.loader.as_ref()).await {
            Ok(()) => {
                self.metrics.program_start(&kind.to_string(), "ok");
                self.log_endpoint(container_id, StatusCode::Ok, format!("program {kind} started"));
                Ok(())
            }
            Err(e) => {
                self.registry.detach_program(container_id, kind);
                self.metrics
                    .program_start(&kind.to_string(), e.metric_label());
                self.log_endpoint(
                    container_id,
                    StatusCode::Failure,
                    format!("program {kind} failed to start: {e}"),
                );
                Err(e)
            }
        }
    }

    pub fn program_stop(&self, container_id: &str, kind: ProgramKind, options: &str) -> Result<()> {
        let program = self.registry.program(container_id, kind)?;
        program.stop(options)?;
        self.registry.detach_program(container_id, kind);
        self.log_endpoint(container_id, StatusCode::Ok, format!("program {kind} stopped"));
        Ok(())
    }

    pub fn program_update_map_entry(
        &self,
        container_id: &str,
        kind: ProgramKind,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.registry
            .program(container_id, kind)?
            .update_element(key, value)
    }

    pub fn program_delete_map_entry(
        &self,
        container_id: &str,
        kind: ProgramKind,
        key: &str,
    ) -> Result<()> {
        self.registry.program(container_id, kind)?.delete_element(key)
    }

    pub fn program_lookup_map_entry(
        &self,
        container_id: &str,
        kind: ProgramKind,
        key: &str,
    ) -> Result<Option<String>> {
        self.registry.program(container_id, kind)?.lookup_element(key)
    }

    pub fn program_dump_map(&self, container_id: &str, kind: ProgramKind) -> Result<String> {
        self.registry.program(container_id, kind)?.dump()
    }

    /// Expects exactly one `key=value` argument.
    pub fn global_map_update(&self, map: GlobalMap, args: &[String]) -> Result<()> {
        let [arg] = args else {
            return Err(Error::Validation(format!(
                "{map} update takes exactly one key=value pair, received {}",
                args.len()
            )));
        };
        let (key, value) = parse_kv_arg(arg)?;
        self.globals.update(map, &key, &value)
    }

    pub fn global_map_delete(&self, map: GlobalMap, key: &str) -> Result<()> {
        self.globals.delete(map, key)
    }

    pub fn global_map_dump(&self, map: GlobalMap) -> Result<String> {
        self.globals.dump(map)
    }

    fn log_endpoint(&self, container_id: &str, code: StatusCode, message: String) {
        if let Err(e) = self.registry.log_status(container_id, code, &message) {
            debug!(container_id, %e, "status not recorded");
        }
    }

    /// Records a running container. Returns false if it was already known.
    pub fn track_container(&self, info: &ContainerInfo) -> bool {
        let mut containers = self.containers.write();
        if containers.contains_key(&info.id) {
            return false;
        }
        containers.insert(
            info.id.clone(),
            TrackedContainer {
                info: info.clone(),
                bound: false,
            },
        );
        true
    }

    pub fn is_tracked(&self, container_id: &str) -> bool {
        self.containers.read().contains_key(container_id)
    }

    /// True only for the first caller after the container was tracked.
    fn mark_bound(&self, container_id: &str) -> bool {
        let mut containers = self.containers.write();
        match containers.get_mut(container_id) {
            Some(tracked) if !tracked.bound => {
                tracked.bound = true;
                true
            }
            _ => false,
        }
    }

    /// Matches a tracked container against plugin registrations and starts
    /// the default programs the first time it binds.
    pub async fn bind_container(
        &self,
        info: ContainerInfo,
        cancel: &CancellationToken,
    ) -> BindOutcome {
        let outcome = wait_for_match(
            &self.registry,
            &info.id,
            info.plugin_endpoint_id.as_deref(),
            self.config.retry,
            cancel,
        )
        .await;
        self.metrics.binding(outcome.label());
        match &outcome {
            BindOutcome::Bound(ep) => {
                info!(container_id = info.id, endpoint = ep.name(), "container bound");
                if self.mark_bound(&info.id) {
                    self.start_default_programs(&info.id).await;
                }
            }
            BindOutcome::Abandoned => info!(
                container_id = info.id,
                attempts = self.config.retry.max_attempts,
                "no endpoint registered, container is not managed here"
            ),
            BindOutcome::Cancelled => debug!(container_id = info.id, "binding cancelled"),
        }
        outcome
    }

    async fn start_default_programs(&self, container_id: &str) {
        for kind in &self.config.default_programs {
            match self
                .program_start(container_id, *kind, &self.config.default_program_options)
                .await
            {
                Ok(()) => {}
                Err(Error::AlreadyExists(what)) => debug!(%what, "program already running"),
                Err(e) => warn!(container_id, program = %kind, %e, "failed to start program"),
            }
        }
    }

    pub fn handle_container_die(&self, container_id: &str) {
        let removed = self.containers.write().remove(container_id);
        if let Some(tracked) = removed {
            debug!(container_id, bound = tracked.bound, labels = ?tracked.info.labels, "container stopped");
            self.log_endpoint(container_id, StatusCode::Ok, "container stopped".into());
        }
    }
}
