//! Process-wide engine configuration with one-way initialization.
//!
//! Every globally-configurable knob (tag indicator, entity table, option
//! defaults) is guarded by a single started-latch. Before the first render
//! the knobs may be assigned freely; once an engine starts, the latch flips
//! and further assignments become no-ops (asserting in debug builds).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Default tag indicator character.
pub const DEFAULT_TAG_INDICATOR: u8 = b'#';

static STARTED: AtomicBool = AtomicBool::new(false);
static TAG_INDICATOR: AtomicU8 = AtomicU8::new(DEFAULT_TAG_INDICATOR);

/// Whether any engine in this process has started rendering.
pub fn started() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Flip the started-latch. Irreversible for the lifetime of the process.
pub(crate) fn mark_started() {
    STARTED.store(true, Ordering::Release);
}

/// The configured tag indicator. Reads are lock-free.
pub fn tag_indicator() -> u8 {
    TAG_INDICATOR.load(Ordering::Relaxed)
}

/// Configure the tag indicator. Must happen before the first render;
/// afterwards the assignment is dropped.
pub fn set_tag_indicator(indicator: u8) {
    if started() {
        debug_assert!(!started(), "tag indicator assigned after engine start");
        log::warn!("ignoring tag indicator assignment after engine start");
        return;
    }
    if !indicator.is_ascii_punctuation() {
        log::warn!("tag indicator {:?} is not punctuation; keeping current", indicator as char);
        return;
    }
    TAG_INDICATOR.store(indicator, Ordering::Relaxed);
}
