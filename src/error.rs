use std::io;

/// Crate-wide error type. Most call sites log and continue rather than
/// propagate: see the variant docs for which layer is expected to swallow
/// each kind.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The spacenavd socket is unreachable or reset. The device reader retries
    /// forever; nothing above this layer ever sees it.
    #[error("spatial device unavailable: {0}")]
    TransientDevice(#[source] io::Error),

    /// Malformed JSON, unknown message type, or a short array from the client.
    /// Logged at warning; the session stays open.
    #[error("malformed session message: {0}")]
    SessionProtocol(String),

    /// An outbound RPC exceeded the 500ms deadline.
    #[error("outbound rpc timed out")]
    RpcTimeout,

    /// The client answered an outbound RPC with CALLERROR.
    #[error("client reported rpc error: {uri}: {description}")]
    RpcReportedError { uri: String, description: String },

    /// `config.set` could not persist to disk. The in-memory config is still
    /// swapped; only the caller's CALLRESULT reflects the failure.
    #[error("failed to persist config: {0}")]
    ConfigPersist(#[source] io::Error),

    /// Cannot bind the listener or load/generate TLS material. The only
    /// variant that terminates the process.
    #[error("fatal startup failure: {0}")]
    FatalStartup(String),
}
