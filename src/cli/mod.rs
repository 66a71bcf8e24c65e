pub mod args;
pub mod validation;

pub use args::Args;
pub use validation::{resolve_source, validate_mountpoint};
