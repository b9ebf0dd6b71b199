//! Two-level lookup tables.
//!
//! # Layout
//!
//! ```text
//! destination address
//! +-----------------+-------------------+
//! |  direct_bits    |  32 - direct_bits |
//! +-----------------+-------------------+
//!         |                  |
//!         v                  |
//! +---------------+          |
//! | DIRECT TABLE  |  2^direct_bits words, resolved or chunk reference
//! +---------------+          |
//!         | base/count       v
//!         v           binary search
//! +---------------+
//! |  RANGE TABLE  |  shared breakpoint storage, deduplicated per chunk
//! +---------------+
//! ```

pub mod format;
mod tables;

pub use format::DirectEntry;
pub use tables::Tables;
