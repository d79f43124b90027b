//! Server configuration
//!
//! Settings for `filegate serve`, loaded from a JSON file and turned into
//! a [`crate::server::Dispatcher`] and listener configuration.

mod settings;

pub use settings::*;
