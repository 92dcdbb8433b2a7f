use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};
use crate::daemon::Daemon;
use crate::daemon::binding::BindOutcome;

/// A running container as reported by the runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Set when the runtime already knows the plugin's endpoint id.
    pub plugin_endpoint_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerEvent {
    Start(ContainerInfo),
    Die(String),
}

/// Source of container lifecycle events.
pub trait ContainerRuntime: Send + Sync {
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>>;

    fn list_running(&self) -> BoxFuture<'_, Result<Vec<ContainerInfo>>>;
}

/// Dispatches runtime events. Each new container is bound on its own task
/// so a slow binding never blocks the stream; repeated starts of a tracked
/// container are ignored.
pub async fn run_event_listener(
    daemon: Arc<Daemon>,
    runtime: Arc<dyn ContainerRuntime>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut events = runtime.events();
    let mut tasks = JoinSet::new();
    info!("started container event listener");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(ContainerEvent::Start(info))) => {
                    if !daemon.track_container(&info) {
                        debug!(container_id = info.id, "ignoring start of tracked container");
                        continue;
                    }
                    let daemon = daemon.clone();
                    let cancel = cancel.child_token();
                    tasks.spawn(async move { daemon.bind_container(info, &cancel).await });
                }
                Some(Ok(ContainerEvent::Die(id))) => daemon.handle_container_die(&id),
                Some(Err(e)) => error!(%e, "container event stream error"),
                None => {
                    info!("container event stream ended");
                    break;
                }
            },
            Some(res) = tasks.join_next(), if !tasks.is_empty() => log_join(res),
        }
    }
    drain(tasks).await;
    Ok(())
}

/// Periodically lists running containers and binds the ones the event
/// stream never reported.
pub async fn run_resync(
    daemon: Arc<Daemon>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let running = match runtime.list_running().await {
                    Ok(running) => running,
                    Err(e) => {
                        warn!(%e, "failed to list running containers");
                        continue;
                    }
                };
                let mut discovered = 0;
                for info in running {
                    if !daemon.track_container(&info) {
                        continue;
                    }
                    discovered += 1;
                    let daemon = daemon.clone();
                    let cancel = cancel.child_token();
                    tasks.spawn(async move { daemon.bind_container(info, &cancel).await });
                }
                debug!(discovered, "container resync finished");
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => log_join(res),
        }
    }
    drain(tasks).await;
    Ok(())
}

async fn drain(mut tasks: JoinSet<BindOutcome>) {
    while let Some(res) = tasks.join_next().await {
        log_join(res);
    }
}

fn log_join(res: std::result::Result<BindOutcome, JoinError>) {
    match res {
        Ok(outcome) => debug!(outcome = outcome.label(), "binding finished"),
        Err(e) => {
            let e = Error::from(e);
            error!(%e, label = e.metric_label(), "binding task failed");
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use futures::stream;

    use super::*;
    use crate::bpf::MemoryMaps;
    use crate::config::Config;
    use crate::endpoint::EndpointRequest;
    use crate::metrics::DaemonMetrics;
    use crate::program::ProgramKind;
    use crate::program::loader::RecordingLoader;

    struct FixedRuntime {
        events: Vec<ContainerEvent>,
        running: Vec<ContainerInfo>,
    }

    impl ContainerRuntime for FixedRuntime {
        fn events(&self) -> BoxStream<'static, Result<ContainerEvent>> {
            stream::iter(self.events.clone().into_iter().map(Ok)).boxed()
        }

        fn list_running(&self) -> BoxFuture<'_, Result<Vec<ContainerInfo>>> {
            Box::pin(async move { Ok(self.running.clone()) })
        }
    }

    fn info(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.into(),
            ..Default::default()
        }
    }

    fn daemon(dir: &tempfile::TempDir) -> Result<(Arc<Daemon>, Arc<RecordingLoader>)> {
        let config = Config {
            run_dir: dir.path().into(),
            ..Config::default()
        };
        let loader = Arc::new(RecordingLoader::default());
        let daemon = Arc::new(Daemon::new(
            config,
            Arc::new(MemoryMaps::new()),
            loader.clone(),
            DaemonMetrics::default(),
        ));
        daemon.endpoint_create(EndpointRequest {
            container_id: Some("c1".into()),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..Default::default()
        })?;
        Ok((daemon, loader))
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_listener_binds_and_forgets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (daemon, loader) = daemon(&dir)?;
        let runtime = Arc::new(FixedRuntime {
            events: vec![
                ContainerEvent::Start(info("c1")),
                ContainerEvent::Start(info("c1")),
                ContainerEvent::Start(info("c2")),
                ContainerEvent::Die("c2".into()),
            ],
            running: vec![],
        });

        run_event_listener(daemon.clone(), runtime, CancellationToken::new()).await?;

        assert_eq!(loader.requests.lock().len(), 1);
        assert!(daemon.registry().program("c1", ProgramKind::L1).is_ok());
        assert!(daemon.is_tracked("c1"));
        assert!(!daemon.is_tracked("c2"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_binds_untracked_containers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (daemon, loader) = daemon(&dir)?;
        let runtime = Arc::new(FixedRuntime {
            events: vec![],
            running: vec![info("c1"), info("c3")],
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_resync(
            daemon.clone(),
            runtime,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        // later sweeps skip containers that are already tracked
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        handle.await??;

        assert_eq!(loader.requests.lock().len(), 1);
        assert!(daemon.is_tracked("c3"));
        assert_eq!(daemon.global_status().bound_containers, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_aborted_binding_task_maps_to_task_error() {
        let handle = tokio::spawn(std::future::pending::<BindOutcome>());
        handle.abort();
        let Err(join) = handle.await else {
            panic!("aborted task returned a value");
        };
        let err = Error::from(join);
        assert!(matches!(err, Error::Task(_)));
        assert_eq!(err.metric_label(), "task");
    }
}
