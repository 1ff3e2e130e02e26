//! # Loader
//!
//! Seam to the external collaborator owning the kernel-facing side of
//! artifacts: loading them, propagating configuration writes into their live
//! memory, attaching their handlers and unloading them. The production
//! implementation lives in `bpf.rs`; tests use an in-memory stand-in.

use std::{fmt, path::Path};

use anyhow::Result;

use crate::core::{artifact::ArtifactManifest, attacher::HookSpec, collector::Emitter};

/// Identifier of a loaded artifact, as returned by `ProgramLoader::load`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ArtifactId(pub(crate) u64);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact#{}", self.0)
    }
}

/// Token representing one live kernel attachment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct AttachToken(pub(crate) u64);

/// Interface to the loader collaborator. Implementations must be safe to use
/// from multiple threads: a detach can race with record delivery.
pub(crate) trait ProgramLoader: Send + Sync {
    /// Read the artifact's manifest (handlers and configuration slots)
    /// without loading it.
    fn inspect(&self, path: &Path) -> Result<ArtifactManifest>;

    /// Load the artifact, returning its id. The actual kernel-side load may
    /// be deferred up to the first attach, as long as `write_global` keeps
    /// working in between.
    fn load(&self, path: &Path) -> Result<ArtifactId>;

    /// Propagate a configuration slot write into the loaded program's
    /// memory. Only legal before any of the artifact's handlers is attached;
    /// the harness enforces this ordering.
    fn write_global(&self, id: ArtifactId, slot: &str, bytes: &[u8]) -> Result<()>;

    /// Attach a handler to its hook point, delivering its invocations
    /// through `emitter`.
    fn attach(&self, id: ArtifactId, spec: &HookSpec, emitter: &Emitter) -> Result<AttachToken>;

    /// Detach a previously attached handler.
    fn detach(&self, id: ArtifactId, token: AttachToken) -> Result<()>;

    /// Unload the artifact. All its handlers must be detached first.
    fn unload(&self, id: ArtifactId) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory loader, standing in for the kernel in the test suite. It
    //! journals every call so tests can assert on sequencing, and lets tests
    //! simulate kernel-driven handler invocations and detach refusals.

    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use anyhow::{anyhow, bail};

    use super::*;
    use crate::core::errors::HarnessError;

    pub(crate) struct MemoryLoader {
        manifest: ArtifactManifest,
        /// Function symbols known to the fake kernel.
        symbols: HashSet<String>,
        /// Handlers whose detach the fake kernel refuses.
        fail_detach: HashSet<String>,
        journal: Mutex<Vec<String>>,
        state: Mutex<MemoryState>,
    }

    #[derive(Default)]
    struct MemoryState {
        next_id: u64,
        loaded: HashSet<u64>,
        next_token: u64,
        /// token -> (artifact, handler)
        attached: HashMap<u64, (u64, String)>,
        emitters: HashMap<String, Emitter>,
        globals: HashMap<String, Vec<u8>>,
    }

    impl MemoryLoader {
        /// Loader where every handler's declared target resolves.
        pub(crate) fn new(manifest: ArtifactManifest) -> MemoryLoader {
            let symbols: Vec<String> =
                manifest.handlers.iter().map(|h| h.target.clone()).collect();
            Self::with_symbols(manifest, &symbols)
        }

        pub(crate) fn with_symbols<S: AsRef<str>>(
            manifest: ArtifactManifest,
            symbols: &[S],
        ) -> MemoryLoader {
            MemoryLoader {
                manifest,
                symbols: symbols.iter().map(|s| s.as_ref().to_string()).collect(),
                fail_detach: HashSet::new(),
                journal: Mutex::new(Vec::new()),
                state: Mutex::new(MemoryState::default()),
            }
        }

        /// Make the fake kernel refuse detaching `handler`.
        pub(crate) fn fail_detach(mut self, handler: &str) -> Self {
            self.fail_detach.insert(handler.to_string());
            self
        }

        /// Simulate a kernel-driven invocation of an attached handler.
        pub(crate) fn fire(&self, handler: &str) -> bool {
            let state = self.state.lock().unwrap();
            match state.emitters.get(handler) {
                Some(emitter) => emitter.fire(handler),
                None => false,
            }
        }

        pub(crate) fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }

        /// Last value written into a global, as seen by the program.
        pub(crate) fn global(&self, slot: &str) -> Option<Vec<u8>> {
            self.state.lock().unwrap().globals.get(slot).cloned()
        }

        pub(crate) fn attached_count(&self) -> usize {
            self.state.lock().unwrap().attached.len()
        }

        pub(crate) fn loaded_count(&self) -> usize {
            self.state.lock().unwrap().loaded.len()
        }

        fn log(&self, entry: String) {
            self.journal.lock().unwrap().push(entry);
        }
    }

    impl ProgramLoader for MemoryLoader {
        fn inspect(&self, _path: &Path) -> Result<ArtifactManifest> {
            self.log("inspect".to_string());
            Ok(self.manifest.clone())
        }

        fn load(&self, _path: &Path) -> Result<ArtifactId> {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.loaded.insert(id);

            self.log("load".to_string());
            Ok(ArtifactId(id))
        }

        fn write_global(&self, id: ArtifactId, slot: &str, bytes: &[u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.loaded.contains(&id.0) {
                bail!("{id} is not loaded");
            }
            state.globals.insert(slot.to_string(), bytes.to_vec());

            self.log(format!("write_global {slot}"));
            Ok(())
        }

        fn attach(&self, id: ArtifactId, spec: &HookSpec, emitter: &Emitter) -> Result<AttachToken> {
            self.log(format!("attach {}", spec.handler));

            let mut state = self.state.lock().unwrap();
            if !state.loaded.contains(&id.0) {
                bail!("{id} is not loaded");
            }
            if !self.symbols.contains(&spec.symbol) {
                return Err(HarnessError::SymbolNotFound(spec.symbol.clone()).into());
            }

            let token = state.next_token;
            state.next_token += 1;
            state.attached.insert(token, (id.0, spec.handler.clone()));
            state.emitters.insert(spec.handler.clone(), emitter.clone());

            Ok(AttachToken(token))
        }

        fn detach(&self, _id: ArtifactId, token: AttachToken) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let (_, handler) = state
                .attached
                .remove(&token.0)
                .ok_or_else(|| anyhow!("Unknown attach token"))?;
            state.emitters.remove(&handler);

            self.log(format!("detach {handler}"));

            if self.fail_detach.contains(&handler) {
                bail!("Kernel refused to detach {handler}");
            }
            Ok(())
        }

        fn unload(&self, id: ArtifactId) -> Result<()> {
            self.log("unload".to_string());

            let mut state = self.state.lock().unwrap();
            if state.attached.values().any(|(a, _)| *a == id.0) {
                bail!("{id} still has attached handlers");
            }
            if !state.loaded.remove(&id.0) {
                bail!("{id} is not loaded");
            }
            Ok(())
        }
    }
}
