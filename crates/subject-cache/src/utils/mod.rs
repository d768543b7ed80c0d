pub mod defer;

pub use defer::{DeferGuard, defer};
