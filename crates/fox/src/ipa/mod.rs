//! IPA handling module.
//!
//! Unpacks archives into a scratch [`WorkingTree`] and packs working trees
//! (or any directory) back into ZIP archives.

pub mod archive;
pub mod extract;

pub use archive::{check_output, pack, resolve_output, write_archive, CompressionLevel};
pub use extract::{extract_ipa, find_app_bundle, validate_ipa, WorkingTree, PAYLOAD_DIR};
