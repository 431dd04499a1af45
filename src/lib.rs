//! agent-mail library root.

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod mailbox;
pub mod memory;
pub mod migrate;
pub mod protocol;
pub mod store;
pub mod transport;

pub use cli::Commands;
pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use identity::Identity;
pub use mailbox::Mailbox;
pub use store::Store;
