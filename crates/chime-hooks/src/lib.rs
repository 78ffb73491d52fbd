//! chime-hooks: Event-driven hook system.
//!
//! Hooks respond to scheduler lifecycle events (timer start/stop, job
//! added/updated/removed, job started/finished) and can execute custom logic.

pub mod events;
pub mod registry;

pub use events::HookEvent;
pub use registry::{HookHandler, HookRegistry};
