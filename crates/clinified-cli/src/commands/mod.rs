pub mod common;
pub mod completions;
pub mod record;
pub mod sync;
