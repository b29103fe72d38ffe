//! Utilities for assembling and running `brahms` test benches.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

pub mod helper_components;
