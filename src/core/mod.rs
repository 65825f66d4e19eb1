//! # Core Protocol Components
//!
//! Low-level framing and read validation.
//!
//! ## Components
//! - **Wire**: fixed-width and length-prefixed reads and writes over async byte streams
//! - **Validate**: pluggable handling of reads that do not match the expected value
//!
//! ## Wire Format
//! ```text
//! [i32 LE] [i64 LE] [u8] [i32 LE len][UTF-8]
//! ```
//!
//! ## Security
//! - Length prefixes are validated before allocation
//! - Secret strings travel in zeroizing buffers

pub mod validate;
pub mod wire;
