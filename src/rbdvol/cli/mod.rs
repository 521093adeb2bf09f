pub mod args;

pub use args::{Commands, RbdVol, ServeArgs};
