//! Error types for the cluster data model.

use thiserror::Error;

/// Errors raised while parsing or validating cluster data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// Endpoint string is not of the form `host:port`.
    #[error("invalid endpoint {0:?}: expected host:port")]
    InvalidEndpoint(String),

    /// Layout has no servers.
    #[error("layout has no servers")]
    EmptyLayout,

    /// An unresponsive server is not a member of the layout.
    #[error("unresponsive server {0} is not a layout server")]
    UnknownUnresponsive(String),
}
