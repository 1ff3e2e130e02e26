//! # Artifact
//!
//! Model of a probe program artifact: the opaque loadable unit produced by an
//! external compiler toolchain, described by a manifest of named probe
//! handlers and named configuration slots.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Result};

use crate::core::errors::HarnessError;
use events::HookKind;

/// Width of a configuration slot. Slots are fixed-width unsigned integers,
/// the width being derived from the size of the backing object in the
/// artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SlotWidth {
    U8,
    U16,
    U32,
    U64,
}

impl SlotWidth {
    pub(crate) fn from_size(size: usize) -> Result<SlotWidth> {
        use SlotWidth::*;
        Ok(match size {
            1 => U8,
            2 => U16,
            4 => U32,
            8 => U64,
            x => bail!("Unsupported slot size ({x} bytes)"),
        })
    }

    pub(crate) fn bytes(&self) -> usize {
        use SlotWidth::*;
        match self {
            U8 => 1,
            U16 => 2,
            U32 => 4,
            U64 => 8,
        }
    }

    /// Number of hexadecimal digits used to render a value of this width.
    pub(crate) fn hex_digits(&self) -> usize {
        self.bytes() * 2
    }

    /// Does the value fit in the width?
    pub(crate) fn fits(&self, value: u64) -> bool {
        match self {
            SlotWidth::U64 => true,
            _ => value < 1u64 << (self.bytes() * 8),
        }
    }

    /// Little-endian representation of a value, truncated to the slot width.
    pub(crate) fn to_le_bytes(&self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.bytes()].to_vec()
    }
}

impl fmt::Display for SlotWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SlotWidth::*;
        match self {
            U8 => write!(f, "u8"),
            U16 => write!(f, "u16"),
            U32 => write!(f, "u32"),
            U64 => write!(f, "u64"),
        }
    }
}

/// Named fixed-width configuration value. Written before attachment, only
/// read by handlers afterwards.
#[derive(Clone, Debug)]
pub(crate) struct ConfigSlot {
    pub(crate) name: String,
    pub(crate) width: SlotWidth,
    pub(crate) value: u64,
}

impl ConfigSlot {
    pub(crate) fn new(name: &str, width: SlotWidth) -> ConfigSlot {
        ConfigSlot {
            name: name.to_string(),
            width,
            value: 0,
        }
    }

    /// Renders the slot as `NAME=0x<zero-padded-hex>`, the number of digits
    /// matching the slot width (e.g. `GLOBAL_u8=0x2A`, `GLOBAL_u32=0xDEADBEEF`).
    pub(crate) fn render(&self) -> String {
        format!(
            "{}=0x{:0digits$X}",
            self.name,
            self.value,
            digits = self.width.hex_digits()
        )
    }
}

/// Descriptor of a probe handler contained in an artifact.
#[derive(Clone, Debug)]
pub(crate) struct HandlerDescriptor {
    pub(crate) name: String,
    pub(crate) kind: HookKind,
    /// Target symbol the handler was compiled against. Used as the hook point
    /// when no explicit hook spec overrides it.
    pub(crate) target: String,
}

/// Manifest of an artifact, as exposed by the loader's inspect step.
#[derive(Clone, Debug, Default)]
pub(crate) struct ArtifactManifest {
    pub(crate) name: String,
    pub(crate) handlers: Vec<HandlerDescriptor>,
    /// Slot table, in declaration order.
    pub(crate) slots: Vec<ConfigSlot>,
}

/// A loaded program artifact. Owned exclusively by the harness once loaded.
///
/// The slot table and the set of attached handlers are kept under a single
/// lock: a slot write is only legal while no handler is attached, and the
/// check must not race with an attach.
pub(crate) struct ProgramArtifact {
    name: String,
    path: PathBuf,
    handlers: Vec<HandlerDescriptor>,
    state: Mutex<ArtifactState>,
}

struct ArtifactState {
    slots: Vec<ConfigSlot>,
    /// Names of the currently attached handlers.
    attached: Vec<String>,
}

impl ProgramArtifact {
    pub(crate) fn new(path: &Path, manifest: ArtifactManifest) -> ProgramArtifact {
        ProgramArtifact {
            name: manifest.name,
            path: path.to_path_buf(),
            handlers: manifest.handlers,
            state: Mutex::new(ArtifactState {
                slots: manifest.slots,
                attached: Vec::new(),
            }),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    pub(crate) fn handler(&self, name: &str) -> Result<&HandlerDescriptor> {
        self.handlers
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| anyhow!("No handler {name} in artifact {}", self.name))
    }

    /// Snapshot of the slot table, in declaration order.
    pub(crate) fn slots(&self) -> Vec<ConfigSlot> {
        self.state.lock().unwrap().slots.clone()
    }

    /// Validate and set a slot value. `propagate` runs under the artifact
    /// lock, with the validated slot and the value in its wire representation,
    /// before the in-memory commit; failing it aborts the write.
    pub(crate) fn set_slot<F>(&self, name: &str, value: u64, propagate: F) -> Result<()>
    where
        F: FnOnce(&ConfigSlot, &[u8]) -> Result<()>,
    {
        let mut state = self.state.lock().unwrap();

        // Slots are write-once-before-attach: check this first so binding any
        // slot of a live artifact fails the same way, known name or not.
        if !state.attached.is_empty() {
            return Err(HarnessError::AlreadyAttached(format!("artifact {}", self.name)).into());
        }

        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| HarnessError::UnknownSlot(name.to_string()))?;
        if !slot.width.fits(value) {
            return Err(HarnessError::SlotWidthMismatch {
                slot: name.to_string(),
                value,
                width: slot.width,
            }
            .into());
        }

        propagate(slot, &slot.width.to_le_bytes(value))?;
        slot.value = value;
        Ok(())
    }

    /// Mark a handler as attached. Double-attaching is detected, not silently
    /// ignored.
    pub(crate) fn mark_attached(&self, handler: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.attached.iter().any(|h| h == handler) {
            return Err(HarnessError::AlreadyAttached(format!("handler {handler}")).into());
        }

        state.attached.push(handler.to_string());
        Ok(())
    }

    pub(crate) fn mark_detached(&self, handler: &str) {
        self.state.lock().unwrap().attached.retain(|h| h != handler);
    }

    pub(crate) fn attached_handlers(&self) -> Vec<String> {
        self.state.lock().unwrap().attached.clone()
    }

    /// Render the trace line for one invocation of a handler, snapshotting
    /// the current slot values:
    /// `[entry] my_kprobe: GLOBAL_u8=0x2A, GLOBAL_u32=0xDEADBEEF`.
    pub(crate) fn render_message(&self, handler: &HandlerDescriptor) -> String {
        let state = self.state.lock().unwrap();
        let slots = state
            .slots
            .iter()
            .map(|s| s.render())
            .collect::<Vec<_>>()
            .join(", ");

        match slots.is_empty() {
            true => format!("[{}] {}", handler.kind, handler.name),
            false => format!("[{}] {}: {slots}", handler.kind, handler.name),
        }
    }
}

impl fmt::Display for ProgramArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Manifest mirroring the reference kprobe test program: two handlers, one
/// 8-bit and one 32-bit slot.
#[cfg(test)]
pub(crate) fn test_manifest() -> ArtifactManifest {
    ArtifactManifest {
        name: "kprobe".to_string(),
        handlers: vec![
            HandlerDescriptor {
                name: "my_kprobe".to_string(),
                kind: HookKind::Entry,
                target: "my_kprobe".to_string(),
            },
            HandlerDescriptor {
                name: "my_kretprobe".to_string(),
                kind: HookKind::Return,
                target: "my_kretprobe".to_string(),
            },
        ],
        slots: vec![
            ConfigSlot::new("GLOBAL_u8", SlotWidth::U8),
            ConfigSlot::new("GLOBAL_u32", SlotWidth::U32),
        ],
    }
}
