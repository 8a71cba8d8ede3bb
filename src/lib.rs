pub mod archive;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod installer;
pub mod linker;
pub mod package;
pub mod prereq;
pub mod provision;
pub mod record;
pub mod resolver;
pub mod runtime;
pub mod state;
pub mod verify;

pub use config::{Config, ConfigOverrides};
pub use error::{ErrorKind, InstallError};
pub use installer::{InstallOutcome, Installer};
pub use package::Manifest;
pub use state::InstallState;
