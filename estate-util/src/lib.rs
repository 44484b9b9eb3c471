#![deny(missing_docs)]
//! This lib provides small shared utilities for use in the `estate` project.

mod arcstr;

pub use arcstr::*;
