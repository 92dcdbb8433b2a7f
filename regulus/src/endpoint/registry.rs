use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, StatusCode};
use crate::program::{Program, ProgramKind};
use crate::{Error, Result};

type Slot = u64;

/// Live endpoints, reachable by container id and by plugin endpoint id.
///
/// Both indices point at the same stored endpoint. Readers always get a
/// copy; mutation happens only under the write lock.
#[derive(Default)]
pub struct EndpointRegistry {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<Slot, Endpoint>,
    by_container_id: HashMap<String, Slot>,
    by_plugin_endpoint_id: HashMap<String, Slot>,
    next_slot: Slot,
}

impl State {
    /// Slot reachable through either identifier. When the two identifiers
    /// lead to different endpoints, the plugin side is folded into the
    /// container side so one endpoint remains.
    fn find(&mut self, container_id: Option<&str>, plugin_endpoint_id: Option<&str>) -> Option<Slot> {
        let by_container = container_id
            .and_then(|id| self.by_container_id.get(id))
            .copied();
        let by_plugin = plugin_endpoint_id
            .and_then(|id| self.by_plugin_endpoint_id.get(id))
            .copied();
        match (by_container, by_plugin) {
            (Some(first), Some(second)) if first != second => {
                self.fold(first, second);
                Some(first)
            }
            (first, second) => first.or(second),
        }
    }

    fn fold(&mut self, into: Slot, from: Slot) {
        let compatible = match (self.endpoints.get(&into), self.endpoints.get(&from)) {
            (Some(a), Some(b)) => {
                !conflicts(&a.container_id, &b.container_id)
                    && !conflicts(&a.plugin_endpoint_id, &b.plugin_endpoint_id)
            }
            _ => false,
        };
        if !compatible {
            warn!(into, from, "identifiers belong to different endpoints, not merging");
            return;
        }
        let Some(other) = self.remove(from) else {
            return;
        };
        let Some(ep) = self.endpoints.get_mut(&into) else {
            return;
        };
        ep.merge_from(&other);
        for (kind, program) in other.programs {
            ep.programs.entry(kind).or_insert(program);
        }
        ep.status.log_ok("merged split endpoint registration");
        info!(endpoint = ep.name(), "merged endpoint registered under both identifiers");
        self.index(into);
    }

    fn index(&mut self, slot: Slot) {
        let Some(ep) = self.endpoints.get(&slot) else {
            return;
        };
        if let Some(id) = ep.container_id.clone() {
            self.by_container_id.insert(id, slot);
        }
        if let Some(id) = ep.plugin_endpoint_id.clone() {
            self.by_plugin_endpoint_id.insert(id, slot);
        }
    }

    fn remove(&mut self, slot: Slot) -> Option<Endpoint> {
        let ep = self.endpoints.remove(&slot)?;
        if let Some(id) = ep.container_id.as_deref() {
            self.by_container_id.remove(id);
        }
        if let Some(id) = ep.plugin_endpoint_id.as_deref() {
            self.by_plugin_endpoint_id.remove(id);
        }
        Some(ep)
    }

    fn by_container_id_mut(&mut self, container_id: &str) -> Result<&mut Endpoint> {
        self.by_container_id
            .get(container_id)
            .and_then(|slot| self.endpoints.get_mut(slot))
            .ok_or_else(|| Error::NotFound(format!("endpoint {container_id}")))
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint`, or merges it into the endpoint already known
    /// under either of its identifiers. Returns a copy of the stored endpoint.
    pub fn insert(&self, endpoint: Endpoint) -> Result<Endpoint> {
        if endpoint.container_id.is_none() && endpoint.plugin_endpoint_id.is_none() {
            return Err(Error::Validation(
                "endpoint requires a container id or a plugin endpoint id".into(),
            ));
        }
        let mut state = self.state.write();
        let existing = state.find(
            endpoint.container_id.as_deref(),
            endpoint.plugin_endpoint_id.as_deref(),
        );
        let slot = match existing {
            Some(slot) => {
                let Some(stored) = state.endpoints.get_mut(&slot) else {
                    return Err(Error::NotFound(format!("endpoint {}", endpoint.name())));
                };
                if conflicts(&stored.container_id, &endpoint.container_id)
                    || conflicts(&stored.plugin_endpoint_id, &endpoint.plugin_endpoint_id)
                {
                    warn!(
                        endpoint = stored.name(),
                        "ignoring conflicting identifier in re-registration"
                    );
                }
                stored.merge_from(&endpoint);
                stored.status.log_ok("endpoint registration updated");
                slot
            }
            None => {
                let slot = state.next_slot;
                state.next_slot += 1;
                endpoint.status.log_ok("endpoint registered");
                state.endpoints.insert(slot, endpoint);
                slot
            }
        };
        state.index(slot);
        let stored = state
            .endpoints
            .get(&slot)
            .cloned()
            .ok_or_else(|| Error::NotFound("endpoint".into()))?;
        debug!(endpoint = stored.name(), "endpoint stored");
        Ok(stored)
    }

    pub fn get_by_container_id(&self, id: &str) -> Option<Endpoint> {
        let state = self.state.read();
        let slot = state.by_container_id.get(id)?;
        state.endpoints.get(slot).cloned()
    }

    pub fn get_by_plugin_endpoint_id(&self, id: &str) -> Option<Endpoint> {
        let state = self.state.read();
        let slot = state.by_plugin_endpoint_id.get(id)?;
        state.endpoints.get(slot).cloned()
    }

    /// Matches a runtime sighting against plugin registrations.
    ///
    /// Fills whichever identifier the stored endpoint lacks and indexes it.
    /// `None` means the endpoint is not registered yet.
    pub fn resolve_and_bind(
        &self,
        container_id: Option<&str>,
        plugin_endpoint_id: Option<&str>,
    ) -> Option<Endpoint> {
        let mut state = self.state.write();
        let slot = state.find(container_id, plugin_endpoint_id)?;
        let ep = state.endpoints.get_mut(&slot)?;
        let filled_container = ep.fill_container_id(container_id);
        let filled_plugin = ep.fill_plugin_endpoint_id(plugin_endpoint_id);
        if filled_container || filled_plugin {
            ep.status.log_ok("endpoint identifiers resolved");
            info!(
                container_id = ep.container_id.as_deref().unwrap_or_default(),
                plugin_endpoint_id = ep.plugin_endpoint_id.as_deref().unwrap_or_default(),
                "bound endpoint identifiers"
            );
        }
        let copy = ep.clone();
        state.index(slot);
        Some(copy)
    }

    pub fn leave_by_container_id(&self, id: &str) -> Result<Endpoint> {
        let mut state = self.state.write();
        let slot = state
            .by_container_id
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("endpoint for container {id}")))?;
        Self::leave(&mut state, slot)
    }

    pub fn leave_by_plugin_endpoint_id(&self, id: &str) -> Result<Endpoint> {
        let mut state = self.state.write();
        let slot = state
            .by_plugin_endpoint_id
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("endpoint {id}")))?;
        Self::leave(&mut state, slot)
    }

    fn leave(state: &mut State, slot: Slot) -> Result<Endpoint> {
        let ep = state
            .remove(slot)
            .ok_or_else(|| Error::NotFound("endpoint".into()))?;
        ep.status.log_ok("endpoint leaving");
        info!(endpoint = ep.name(), "endpoint left");
        Ok(ep)
    }

    pub fn list(&self) -> Vec<Endpoint> {
        self.state.read().endpoints.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends to the endpoint's history. Only the shared registry lock is
    /// held; the history has its own lock.
    pub fn log_status(&self, container_id: &str, code: StatusCode, message: &str) -> Result<()> {
        let state = self.state.read();
        let ep = state
            .by_container_id
            .get(container_id)
            .and_then(|slot| state.endpoints.get(slot))
            .ok_or_else(|| Error::NotFound(format!("endpoint {container_id}")))?;
        ep.log_status(code, message);
        Ok(())
    }

    pub fn update_options(
        &self,
        container_id: &str,
        changes: &BTreeMap<String, bool>,
    ) -> Result<Endpoint> {
        let mut state = self.state.write();
        let ep = state.by_container_id_mut(container_id)?;
        let changed = ep.options.apply(changes);
        if changed > 0 {
            ep.status
                .log_ok(format!("{changed} endpoint option(s) updated"));
        }
        Ok(ep.clone())
    }

    /// Attaches the program built by `build` unless one of the same kind is
    /// already attached. The slot is taken before the program is started so
    /// concurrent starts of one kind cannot both proceed.
    pub fn attach_program<F>(
        &self,
        container_id: &str,
        kind: ProgramKind,
        build: F,
    ) -> Result<Arc<Program>>
    where
        F: FnOnce(&Endpoint) -> Result<Program>,
    {
        let mut state = self.state.write();
        let ep = state.by_container_id_mut(container_id)?;
        if ep.programs.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "program {kind} for container {container_id}"
            )));
        }
        let program = Arc::new(build(ep)?);
        ep.programs.insert(kind, program.clone());
        Ok(program)
    }

    pub fn detach_program(&self, container_id: &str, kind: ProgramKind) -> Option<Arc<Program>> {
        let mut state = self.state.write();
        let ep = state.by_container_id_mut(container_id).ok()?;
        ep.programs.remove(&kind)
    }

    pub fn program(&self, container_id: &str, kind: ProgramKind) -> Result<Arc<Program>> {
        let state = self.state.read();
        state
            .by_container_id
            .get(container_id)
            .and_then(|slot| state.endpoints.get(slot))
            .and_then(|ep| ep.programs.get(&kind).cloned())
            .ok_or_else(|| Error::NotFound(format!("program {kind} for container {container_id}")))
    }
}

fn conflicts(stored: &Option<String>, incoming: &Option<String>) -> bool {
    matches!((stored, incoming), (Some(a), Some(b)) if a != b)
}
