//! # Harness
//!
//! Top-level coordinator composing the loader, the binder, the attacher and
//! the collector: load -> bind configuration -> attach -> collect, and the
//! reverse teardown.

use std::{
    env,
    fmt,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::core::{
    artifact::ProgramArtifact,
    attacher::{AttachedHandler, HookSpec, ProbeAttacher},
    binder::ConfigBinder,
    bpf::BpfLoader,
    collector::{CollectResult, EventCollector, RECORDS_POLL_TIMEOUT_MS, RECORD_QUEUE_CAPACITY},
    errors::HarnessError,
    loader::{ArtifactId, ProgramLoader},
};

/// Environment override for the record poll timeout, read once at startup.
pub(crate) const POLL_TIMEOUT_ENV: &str = "HARNESS_POLL_TIMEOUT_MS";

/// Poll timeout to use, taking the environment override into account.
pub(crate) fn poll_timeout_from_env() -> Result<Duration> {
    match env::var(POLL_TIMEOUT_ENV) {
        Ok(ms) => Ok(Duration::from_millis(ms.parse().with_context(|| {
            format!("Invalid {POLL_TIMEOUT_ENV} value '{ms}'")
        })?)),
        Err(_) => Ok(Duration::from_millis(RECORDS_POLL_TIMEOUT_MS)),
    }
}

/// Harness owning the run sequencing over a loader implementation.
pub(crate) struct Harness {
    loader: Arc<dyn ProgramLoader>,
    poll_timeout: Duration,
    queue_capacity: usize,
}

impl Harness {
    /// Harness backed by the BPF loader.
    pub(crate) fn new() -> Harness {
        Self::with_loader(Arc::new(BpfLoader::new()))
    }

    /// Harness backed by a custom loader.
    pub(crate) fn with_loader(loader: Arc<dyn ProgramLoader>) -> Harness {
        Harness {
            loader,
            poll_timeout: Duration::from_millis(RECORDS_POLL_TIMEOUT_MS),
            queue_capacity: RECORD_QUEUE_CAPACITY,
        }
    }

    pub(crate) fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[cfg(test)]
    fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Run an artifact: load it, bind `config_values`, attach `hook_specs`
    /// (or, if empty, every handler at its declared target) and start
    /// delivering records to `on_record`. On any startup failure all
    /// completed steps are unwound before the error is surfaced; no partial
    /// attachment state is left live.
    pub(crate) fn run<F>(
        &self,
        path: &Path,
        config_values: &[(String, u64)],
        hook_specs: &[HookSpec],
        on_record: F,
    ) -> Result<RunHandle>
    where
        F: FnMut(CollectResult) + Send + 'static,
    {
        let manifest = self
            .loader
            .inspect(path)
            .map_err(|e| HarnessError::LoadFailure(format!("{e:#}")))
            .context("inspecting artifact")?;
        let artifact = Arc::new(ProgramArtifact::new(path, manifest));
        let id = self
            .loader
            .load(path)
            .map_err(|e| HarnessError::LoadFailure(format!("{e:#}")))
            .context("loading artifact")?;

        info!("Loaded {artifact}");

        let binder = ConfigBinder::new(Arc::clone(&self.loader), Arc::clone(&artifact), id);
        let attacher = ProbeAttacher::new(Arc::clone(&self.loader), Arc::clone(&artifact), id);
        let mut collector =
            EventCollector::with_capacity(self.queue_capacity).poll_timeout(self.poll_timeout);
        let mut handles = Vec::new();

        let specs = match hook_specs.is_empty() {
            false => hook_specs.to_vec(),
            true => artifact
                .handlers()
                .iter()
                .map(|h| HookSpec::new(&h.name, h.kind, &h.target))
                .collect(),
        };

        let res: Result<()> = (|| {
            for (slot, value) in config_values {
                binder
                    .bind(slot, *value)
                    .with_context(|| format!("binding configuration slot {slot}"))?;
            }
            for spec in specs.iter() {
                handles.push(
                    attacher
                        .attach(spec, &collector)
                        .with_context(|| format!("attaching {spec}"))?,
                );
            }
            collector.subscribe(on_record).context("starting the collector")
        })();

        if let Err(e) = res {
            Self::teardown(&attacher, &mut handles, &mut collector, &self.loader, id);
            return Err(e);
        }

        info!("{} handler(s) attached", handles.len());

        Ok(RunHandle {
            inner: Arc::new(RunInner {
                loader: Arc::clone(&self.loader),
                attacher,
                id,
                state: Mutex::new(Some(RunState { handles, collector })),
            }),
        })
    }

    /// Best-effort teardown, in reverse startup order: detach all handlers,
    /// stop the collector, unload the artifact. Failures are logged and do
    /// not stop the remaining steps.
    fn teardown(
        attacher: &ProbeAttacher,
        handles: &mut [AttachedHandler],
        collector: &mut EventCollector,
        loader: &Arc<dyn ProgramLoader>,
        id: ArtifactId,
    ) {
        handles.iter_mut().for_each(|handle| {
            if let Err(e) = attacher.detach(handle, collector) {
                warn!("Could not detach {handle}: {e}");
            }
        });

        if let Err(e) = collector.stop() {
            warn!("Could not stop the collector: {e}");
        }
        if let Err(e) = loader.unload(id) {
            warn!("Could not unload {id}: {e}");
        }
    }
}

/// Handle over a running collection, returned by `Harness::run`. Clones share
/// the same run.
#[derive(Clone)]
pub(crate) struct RunHandle {
    inner: Arc<RunInner>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle").finish_non_exhaustive()
    }
}

struct RunInner {
    loader: Arc<dyn ProgramLoader>,
    attacher: ProbeAttacher,
    id: ArtifactId,
    /// Live state, taken by the first `stop()`.
    state: Mutex<Option<RunState>>,
}

struct RunState {
    handles: Vec<AttachedHandler>,
    collector: EventCollector,
}

impl RunHandle {
    /// Stop the run: detach all handlers, stop the collector and unload the
    /// artifact, in that order. Idempotent and callable from any thread.
    pub(crate) fn stop(&self) -> Result<()> {
        let state = self.inner.state.lock().unwrap().take();
        if let Some(mut state) = state {
            Harness::teardown(
                &self.inner.attacher,
                &mut state.handles,
                &mut state.collector,
                &self.inner.loader,
                self.inner.id,
            );
        }
        Ok(())
    }

    /// Names of the currently attached handlers.
    pub(crate) fn attached_handlers(&self) -> Vec<String> {
        self.inner.attacher.artifact().attached_handlers()
    }
}

/// The run stops when the last handle is dropped, making the teardown
/// guaranteed even on error paths that never call `stop()`.
impl Drop for RunInner {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap().take();
        if let Some(mut state) = state {
            Harness::teardown(
                &self.attacher,
                &mut state.handles,
                &mut state.collector,
                &self.loader,
                self.id,
            );
        }
    }
}
