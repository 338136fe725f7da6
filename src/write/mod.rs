//! Serializers for the MIMI binary formats.
//!
//! Objects and images are bounded by the user arena they must load
//! into, so a serialized file is assembled in memory and handed to the
//! volume layer in a single write. Each builder knows its exact
//! serialized size, reserves it once, and appends its header, section
//! bytes, and record tables through [`crate::pod::bytes_of`] and
//! [`crate::pod::bytes_of_slice`]. Streaming output is the business of
//! [`crate::stream`], not this module.

mod obj;
pub use obj::*;

mod task;
pub use task::*;
