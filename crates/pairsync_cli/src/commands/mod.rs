//! CLI command implementations.

pub mod decode;
pub mod dump_spool;
pub mod simulate;
