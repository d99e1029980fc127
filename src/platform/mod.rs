//! Thin platform primitives: namespace/mount syscall wrappers, path helpers,
//! fatal-assertion helpers, and the fork-surviving warnings buffer.

pub mod assert;
pub mod mount;
pub mod namespaces;
pub mod path;
pub mod warnings;
