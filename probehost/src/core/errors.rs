//! Failure kinds surfaced by the harness operations.

use events::HookKind;

use crate::core::artifact::SlotWidth;

/// Specific failure kinds of the bind/attach/detach/load operations. Callers
/// needing to discriminate (e.g. to distinguish a startup failure from a
/// configuration mistake) can downcast the anyhow chain to this type.
#[derive(thiserror::Error, Debug)]
pub(crate) enum HarnessError {
    /// The artifact has no configuration slot with this name.
    #[error("unknown configuration slot {0}")]
    UnknownSlot(String),
    /// The value does not fit the slot's declared width.
    #[error("value {value:#x} does not fit slot {slot} ({width})")]
    SlotWidthMismatch {
        slot: String,
        value: u64,
        width: SlotWidth,
    },
    /// Emitted when binding a slot of an artifact with live handlers, or when
    /// attaching a handler twice.
    #[error("{0} is already attached")]
    AlreadyAttached(String),
    /// The requested hook kind disagrees with the handler declaration.
    #[error("handler {handler} is declared as {declared} but was requested as {requested}")]
    HookKindMismatch {
        handler: String,
        declared: HookKind,
        requested: HookKind,
    },
    /// The target symbol cannot be resolved in the running kernel.
    #[error("symbol {0} not found in the running kernel")]
    SymbolNotFound(String),
    /// The artifact could not be inspected or loaded.
    #[error("could not load artifact: {0}")]
    LoadFailure(String),
    /// The kernel refused to detach a handler. Fatal for that handle only.
    #[error("could not detach {0}")]
    DetachFailure(String),
}
