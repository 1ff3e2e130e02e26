//! # Attacher
//!
//! Attachment lifecycle of probe handlers: validating hook requests against
//! the artifact manifest, activating handlers through the loader and tearing
//! them down again.

use std::{fmt, sync::Arc};

use anyhow::Result;
use log::debug;

use crate::core::{
    artifact::ProgramArtifact,
    collector::EventCollector,
    errors::HarnessError,
    loader::{ArtifactId, AttachToken, ProgramLoader},
};
use events::HookKind;

/// Hook point requested for a handler: a kernel symbol plus the entry/return
/// designation.
#[derive(Clone, Debug)]
pub(crate) struct HookSpec {
    pub(crate) handler: String,
    pub(crate) kind: HookKind,
    pub(crate) symbol: String,
}

impl HookSpec {
    pub(crate) fn new(handler: &str, kind: HookKind, symbol: &str) -> HookSpec {
        HookSpec {
            handler: handler.to_string(),
            kind,
            symbol: symbol.to_string(),
        }
    }
}

/// Allow nice log messages, mirroring the cli syntax.
impl fmt::Display for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.handler, self.kind, self.symbol)
    }
}

/// States of an attached handler. `Detached` is terminal: re-attaching a
/// handler produces a new handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AttachState {
    Attached,
    Detached,
}

/// Live (or already torn down) kernel attachment of a single handler. Holds
/// a reference to the handler identity and the kernel attachment token, not
/// the handler itself.
#[derive(Debug)]
pub(crate) struct AttachedHandler {
    handler: String,
    kind: HookKind,
    symbol: String,
    token: AttachToken,
    state: AttachState,
}

impl AttachedHandler {
    pub(crate) fn state(&self) -> AttachState {
        self.state
    }
}

impl fmt::Display for AttachedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.handler, self.kind, self.symbol)
    }
}

/// ProbeAttacher activates handlers of a loaded artifact against kernel hook
/// points and manages their lifecycle.
pub(crate) struct ProbeAttacher {
    loader: Arc<dyn ProgramLoader>,
    artifact: Arc<ProgramArtifact>,
    id: ArtifactId,
}

impl ProbeAttacher {
    pub(crate) fn new(
        loader: Arc<dyn ProgramLoader>,
        artifact: Arc<ProgramArtifact>,
        id: ArtifactId,
    ) -> ProbeAttacher {
        ProbeAttacher {
            loader,
            artifact,
            id,
        }
    }

    pub(crate) fn artifact(&self) -> &Arc<ProgramArtifact> {
        &self.artifact
    }

    /// Attach `spec.handler` to the requested hook point. The requested kind
    /// must match the handler declaration and a handler can only be attached
    /// once at a time.
    pub(crate) fn attach(
        &self,
        spec: &HookSpec,
        collector: &EventCollector,
    ) -> Result<AttachedHandler> {
        let desc = self.artifact.handler(&spec.handler)?;
        if desc.kind != spec.kind {
            return Err(HarnessError::HookKindMismatch {
                handler: spec.handler.clone(),
                declared: desc.kind,
                requested: spec.kind,
            }
            .into());
        }

        // Freeze the record message now: the slots cannot change once the
        // handler is attached.
        let message = self.artifact.render_message(desc);

        self.artifact.mark_attached(&spec.handler)?;
        let emitter = collector.emitter();
        emitter.register(&spec.handler, desc.kind, message);

        let token = match self.loader.attach(self.id, spec, &emitter) {
            Ok(token) => token,
            Err(e) => {
                emitter.seal(&spec.handler);
                self.artifact.mark_detached(&spec.handler);
                return Err(e);
            }
        };

        debug!("Attached {spec}");
        Ok(AttachedHandler {
            handler: spec.handler.clone(),
            kind: spec.kind,
            symbol: spec.symbol.clone(),
            token,
            state: AttachState::Attached,
        })
    }

    /// Detach a handler. Idempotent: detaching an already detached handle is
    /// a no-op returning success. Once this returns no record of the handler
    /// can be delivered anymore.
    pub(crate) fn detach(
        &self,
        handle: &mut AttachedHandler,
        collector: &EventCollector,
    ) -> Result<()> {
        if handle.state == AttachState::Detached {
            return Ok(());
        }
        // The handle is gone even if the kernel refuses the detach below.
        handle.state = AttachState::Detached;

        collector.emitter().seal(&handle.handler);
        let res = self.loader.detach(self.id, handle.token);
        collector.drain_detached(&handle.handler);
        self.artifact.mark_detached(&handle.handler);

        match res {
            Ok(()) => {
                debug!("Detached {handle}");
                Ok(())
            }
            Err(e) => {
                Err(HarnessError::DetachFailure(format!("{}: {e}", handle.handler)).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{
        artifact::{test_manifest, ArtifactManifest},
        collector::CollectResult,
        loader::memory::MemoryLoader,
    };

    struct Fixture {
        loader: Arc<MemoryLoader>,
        attacher: ProbeAttacher,
        collector: EventCollector,
    }

    fn setup(loader: MemoryLoader, manifest: ArtifactManifest) -> Fixture {
        let loader = Arc::new(loader);
        let artifact = Arc::new(ProgramArtifact::new(
            std::path::Path::new("kprobe.bpf.o"),
            manifest,
        ));
        let id = loader.load(artifact.path()).unwrap();

        Fixture {
            attacher: ProbeAttacher::new(Arc::clone(&loader) as Arc<dyn ProgramLoader>, artifact, id),
            loader,
            collector: EventCollector::new(),
        }
    }

    fn fixture() -> Fixture {
        setup(MemoryLoader::new(test_manifest()), test_manifest())
    }

    #[test]
    fn attach_and_fire() {
        let f = fixture();

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "my_kprobe");
        let handle = f.attacher.attach(&spec, &f.collector).unwrap();
        assert_eq!(handle.state(), AttachState::Attached);

        assert!(f.loader.fire("my_kprobe"));

        let results = f.collector.poll(Duration::from_millis(100));
        assert_eq!(results.len(), 1);
        match &results[0] {
            CollectResult::Record(record) => {
                assert_eq!(record.handler, "my_kprobe");
                assert_eq!(record.seq, 0);
                assert_eq!(
                    record.message,
                    "[entry] my_kprobe: GLOBAL_u8=0x00, GLOBAL_u32=0x00000000"
                );
            }
            x => panic!("Unexpected result {x:?}"),
        }
    }

    #[test]
    fn attach_twice() {
        let f = fixture();

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "my_kprobe");
        let _handle = f.attacher.attach(&spec, &f.collector).unwrap();

        let err = f.attacher.attach(&spec, &f.collector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::AlreadyAttached(_))
        ));

        // Exactly one attachment exists.
        assert_eq!(f.loader.attached_count(), 1);
    }

    #[test]
    fn attach_kind_mismatch() {
        let f = fixture();

        let spec = HookSpec::new("my_kprobe", HookKind::Return, "my_kprobe");
        let err = f.attacher.attach(&spec, &f.collector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::HookKindMismatch { .. })
        ));

        assert_eq!(f.loader.attached_count(), 0);
        assert!(f.attacher.artifact().attached_handlers().is_empty());
    }

    #[test]
    fn attach_unknown_symbol() {
        let f = setup(
            MemoryLoader::with_symbols(test_manifest(), &["target_fn"]),
            test_manifest(),
        );

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "not_a_symbol");
        let err = f.attacher.attach(&spec, &f.collector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::SymbolNotFound(_))
        ));

        // The failed attach left no state behind: attaching with a valid
        // symbol works.
        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "target_fn");
        assert!(f.attacher.attach(&spec, &f.collector).is_ok());
    }

    #[test]
    fn detach_is_idempotent() {
        let f = fixture();

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "my_kprobe");
        let mut handle = f.attacher.attach(&spec, &f.collector).unwrap();

        assert!(f.attacher.detach(&mut handle, &f.collector).is_ok());
        assert_eq!(handle.state(), AttachState::Detached);
        assert_eq!(f.loader.attached_count(), 0);

        // Second detach is a no-op success; and no record can be delivered
        // once the first returned.
        assert!(f.attacher.detach(&mut handle, &f.collector).is_ok());
        assert!(!f.loader.fire("my_kprobe"));
        assert!(f.collector.poll(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn detach_failure_is_fatal_for_the_handle() {
        let f = setup(
            MemoryLoader::new(test_manifest()).fail_detach("my_kprobe"),
            test_manifest(),
        );

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "my_kprobe");
        let mut handle = f.attacher.attach(&spec, &f.collector).unwrap();

        let err = f.attacher.detach(&mut handle, &f.collector).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::DetachFailure(_))
        ));

        // The handle is terminally detached regardless.
        assert_eq!(handle.state(), AttachState::Detached);
        assert!(f.attacher.detach(&mut handle, &f.collector).is_ok());
    }

    #[test]
    fn reattach_after_detach() {
        let f = fixture();

        let spec = HookSpec::new("my_kprobe", HookKind::Entry, "my_kprobe");
        let mut handle = f.attacher.attach(&spec, &f.collector).unwrap();
        f.loader.fire("my_kprobe");
        f.attacher.detach(&mut handle, &f.collector).unwrap();

        // A fresh attach produces a new handle and the sequence numbers keep
        // increasing.
        let _handle = f.attacher.attach(&spec, &f.collector).unwrap();
        assert!(f.loader.fire("my_kprobe"));

        let results = f.collector.poll(Duration::from_millis(100));
        assert_eq!(results.len(), 1);
        match &results[0] {
            CollectResult::Record(record) => assert_eq!(record.seq, 1),
            x => panic!("Unexpected result {x:?}"),
        }
    }
}
