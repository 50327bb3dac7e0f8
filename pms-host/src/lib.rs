//! Host-side extension manager for the PMS framework.
//!
//! The manager spawns plugin processes, authenticates their registration
//! over a loopback websocket channel and executes named extension points as
//! ordered, concurrent pipelines spanning host and plugin contributions.
//!
//! ```no_run
//! use pms_host::{CancellationToken, ExtensionConfig, WsManager};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let manager = WsManager::builder().init().await?;
//! manager.register_host_extension::<String, String, _>(
//!     ExtensionConfig::new("app.greet.default", "greet"),
//!     |name| Ok(format!("hello {name}")),
//! );
//! manager
//!     .load_plugins(&CancellationToken::new(), ["./plugins/hello"])
//!     .await?;
//!
//! let mut results = manager.execute::<String, String>("greet", "Anton".into());
//! while let Some(result) = results.recv().await {
//!     println!("{}", result?);
//! }
//! # Ok(())
//! # }
//! ```

mod correlation;
mod error;
mod execute;
mod launcher;
mod manager;
mod ordering;
mod runtime;
mod secret;
mod session;

pub use error::{ExecuteError, ManagerError};
pub use manager::{FailureProcessor, ManagerBuilder, WsManager};
pub use pms_sdk::protocol::{ExtensionConfig, PluginError};
pub use tokio_util::sync::CancellationToken;
