//! # Code
//!
//! Machine code helpers: trampoline encodings and analysis of the code they overwrite

pub mod decode;
pub mod x64;
