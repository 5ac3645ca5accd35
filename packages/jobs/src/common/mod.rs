// Common types and utilities shared across the crate

pub mod pagination;
pub mod utils;

pub use pagination::{Page, PageArgs};
pub use utils::*;
