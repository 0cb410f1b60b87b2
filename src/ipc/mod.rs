//! Inter-process messaging
//!
//! Transport (`channel`), field codec (`codec`) and the typed commands
//! exchanged between controller, zygote, workers and helpers (`protocol`).

pub mod channel;
pub mod codec;
pub mod protocol;
