//! hwbridge server library
//!
//! The daemon brokers access between browser-origin web applications and
//! hardware security devices connected by USB. Browsers cannot speak
//! arbitrary USB, so the daemon exposes a narrow HTTP API on a fixed
//! loopback address and translates those calls into framed interrupt
//! transfers, enforcing exclusive per-device sessions across concurrent
//! clients.
//!
//! The crate splits into:
//!
//! - [`core`]: the session and transport engine (device registry, session
//!   lifecycle, call engine, long-poll change notifier);
//! - [`http`]: the HTTP surface mapping requests onto core operations,
//!   including origin validation and the status page;
//! - [`logging`]: tracing subscriber setup.

pub mod core;
pub mod http;
pub mod logging;

pub use crate::core::{CallMode, Core, CoreError};
