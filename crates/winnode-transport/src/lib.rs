//! Remote host transport for winnode
//!
//! A [`Connector`] makes single connection attempts; [`connect`] wraps it in
//! the bounded retry loop used while hosts finish booting. Sessions run
//! commands and copy files into a remote directory.

#![deny(missing_docs)]

pub mod session;
pub mod ssh;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use session::{
    connect, remote_path, transfer_bytes, ConnectTarget, Connector, Credential, Session,
};
pub use ssh::SshConnector;
