use pms_sdk::protocol::PluginError;
use thiserror::Error;

/// Lifecycle and configuration failures surfaced by the manager, either as
/// return values or through the failure processor.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Binding the loopback listener failed.
    #[error("bind plugin listener: {0}")]
    Listen(#[source] std::io::Error),

    /// A plugin executable could not be started.
    #[error("can't start plugin {command}: {source}")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// Two extensions registered under the same ID within one extension
    /// point.
    #[error("duplicate extension id \"{0}\"")]
    DuplicateExtension(String),

    /// The before/after declarations of an extension point contain a cycle.
    #[error("circular dependency for extension \"{id}\" via \"{dependency}\"")]
    CircularDependency {
        /// Extension on the cycle that was being resolved.
        id: String,
        /// The dependency that closed the cycle.
        dependency: String,
    },

    /// The cancellation token fired while awaiting plugin registrations.
    #[error("awaiting plugin initialization: cancelled")]
    Cancelled,

    /// A response frame arrived for a request that is not in flight.
    #[error("unknown correlationID {0}")]
    UnknownCorrelation(String),

    /// Writing a response to a reentrant plugin request failed.
    #[error("write response to plugin: {0}")]
    ResponseWrite(String),
}

/// Per-request failures. These flow as items through an execute result
/// sequence and never take the manager down.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The extension itself failed, locally or behind a remote error frame.
    #[error(transparent)]
    Extension(#[from] PluginError),

    /// The owning connection closed while the request was in flight.
    #[error("plugin failed before processing finished")]
    PluginFailed,

    /// Encoding the input or decoding the response payload failed.
    #[error("extension payload codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Writing the request frame to the plugin connection failed.
    #[error("write message to plugin: {0}")]
    Transport(#[source] tokio_tungstenite::tungstenite::Error),

    /// A local extension produced an output of a different type than the
    /// call site expects.
    #[error("extension \"{extension}\" produced an incompatible output type")]
    OutputType {
        /// The offending extension ID.
        extension: String,
    },
}
