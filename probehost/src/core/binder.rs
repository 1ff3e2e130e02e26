//! # Binder
//!
//! Configuration slot binding: resolves and writes slot values into a loaded
//! artifact, before any of its handlers gets attached. Handlers only ever
//! read the slots, so once attachments exist the values are frozen and no
//! read-side synchronization is needed.

use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::core::{
    artifact::ProgramArtifact,
    loader::{ArtifactId, ProgramLoader},
};

/// ConfigBinder writes configuration values into an artifact, propagating
/// them into the loaded program's live memory through the loader.
pub(crate) struct ConfigBinder {
    loader: Arc<dyn ProgramLoader>,
    artifact: Arc<ProgramArtifact>,
    id: ArtifactId,
}

impl ConfigBinder {
    pub(crate) fn new(
        loader: Arc<dyn ProgramLoader>,
        artifact: Arc<ProgramArtifact>,
        id: ArtifactId,
    ) -> ConfigBinder {
        ConfigBinder {
            loader,
            artifact,
            id,
        }
    }

    /// Set `slot` to `value`. Fails if the slot is unknown, if the value does
    /// not fit the declared width or if any handler of the artifact is
    /// currently attached. The loader write happens under the artifact lock,
    /// so it cannot race with an attach.
    pub(crate) fn bind(&self, slot: &str, value: u64) -> Result<()> {
        self.artifact.set_slot(slot, value, |slot, bytes| {
            self.loader.write_global(self.id, &slot.name, bytes)
        })?;

        debug!("Bound {slot}={value:#x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::core::{artifact::test_manifest, errors::HarnessError, loader::memory::MemoryLoader};

    fn fixture() -> (Arc<MemoryLoader>, ConfigBinder, Arc<ProgramArtifact>) {
        let loader = Arc::new(MemoryLoader::new(test_manifest()));
        let artifact = Arc::new(ProgramArtifact::new(
            Path::new("kprobe.bpf.o"),
            test_manifest(),
        ));
        let id = loader.load(artifact.path()).unwrap();

        let binder = ConfigBinder::new(
            Arc::clone(&loader) as Arc<dyn ProgramLoader>,
            Arc::clone(&artifact),
            id,
        );
        (loader, binder, artifact)
    }

    #[test]
    fn bind_propagates_to_the_loader() {
        let (loader, binder, artifact) = fixture();

        binder.bind("GLOBAL_u8", 0x2a).unwrap();
        binder.bind("GLOBAL_u32", 0xdeadbeef).unwrap();

        // In-memory view and loaded-program view agree.
        assert_eq!(artifact.slots()[0].value, 0x2a);
        assert_eq!(loader.global("GLOBAL_u8").unwrap(), vec![0x2a]);
        assert_eq!(
            loader.global("GLOBAL_u32").unwrap(),
            vec![0xef, 0xbe, 0xad, 0xde]
        );
    }

    #[test]
    fn bind_unknown_slot() {
        let (loader, binder, _) = fixture();

        let err = binder.bind("GLOBAL_u64", 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::UnknownSlot(_))
        ));
        assert!(loader.global("GLOBAL_u64").is_none());
    }

    #[test]
    fn bind_width_mismatch() {
        let (loader, binder, _) = fixture();

        let err = binder.bind("GLOBAL_u8", 0x1ff).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::SlotWidthMismatch { .. })
        ));
        assert!(loader.global("GLOBAL_u8").is_none());
    }

    #[test]
    fn bind_after_attach() {
        let (_, binder, artifact) = fixture();

        artifact.mark_attached("my_kretprobe").unwrap();

        for slot in ["GLOBAL_u8", "GLOBAL_u32"] {
            let err = binder.bind(slot, 1).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<HarnessError>(),
                Some(HarnessError::AlreadyAttached(_))
            ));
        }
    }
}
