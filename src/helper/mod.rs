//! Sandbox helper
//!
//! An unconfined process that performs lookups a chrooted worker cannot do
//! itself. Each helper serves one worker channel and watches a liveness pipe
//! from its parent; it exits as soon as either side disappears.

pub mod fonts;
pub mod multiplexer;
pub mod process;

pub use fonts::{DirectoryFontCatalog, FontCatalog, FontFile};
pub use multiplexer::{Event, Multiplexer};
pub use process::{HelperExit, HelperLoop, HelperProcess, PendingRequest};
