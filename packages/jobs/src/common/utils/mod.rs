pub mod dedupe_key;
pub mod id;

pub use dedupe_key::*;
pub use id::*;
