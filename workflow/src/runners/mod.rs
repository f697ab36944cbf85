pub mod linear;

pub const LINEAR: &str = "linear";

/// Every runner `train_net` can be asked for.
pub const NAMES: &[&str] = &[LINEAR];
