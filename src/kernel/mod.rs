//! Thin wrappers around Linux kernel primitives.

pub mod confinement;
pub mod fd;
pub mod process;
