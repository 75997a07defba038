//! Rewrites the control flow graph of kernel IR functions into structured
//! form: every loop gets a single merge and continue block, every selection
//! a single merge block, and PHIs are repaired to match the new edges.

pub mod cfg;
pub mod config;
pub mod error;
pub mod index;
pub mod lir;
