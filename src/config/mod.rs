pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_timeout_secs() -> f64 {
    0.0
}

fn default_max_threads() -> usize {
    8
}

fn default_idle_timeout_secs() -> u64 {
    10
}
