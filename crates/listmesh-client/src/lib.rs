//! Listmesh Client - sync transport and sessions
//!
//! - **Transport**: [`SyncClient`] links a local store to the server socket of
//!   one user and keeps it linked across drops
//! - **Session**: [`Session`] ties passphrase login, local persistence and the
//!   transport together for one signed-in user

pub mod session;
pub mod transport;

pub use session::Session;
pub use transport::{SyncClient, SyncStatus};
