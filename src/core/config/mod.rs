pub mod data;
pub mod io;

pub use data::{path_display, Config, VaultBackend};
pub use io::ConfigError;
