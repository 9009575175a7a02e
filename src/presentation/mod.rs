//! Presentation layer adapters.

/// Reusable widgets.
pub mod widgets;

pub use widgets::{AsyncLoader, ImageDisplay, ImageLoadedEvent};
