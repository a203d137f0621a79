//! Controller error type.
//!
//! Most failures GMCast meets are attributable to a single peer and are
//! handled inside the callback that observed them: the peer is failed,
//! destroyed and scheduled for reconnect. `Error` is reserved for the
//! remaining classes — configuration problems at construction, listener
//! setup failures, and invariant violations that signal a bug.

use gmcast_core::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violated: {0}")]
    Invariant(String),
}
