use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::error::ManagerError;
use crate::manager::ManagerInner;

/// Spawn a plugin executable, handing it the listener port and its secret
/// through the `-pms-port`/`-pms-secret` arguments. The child owns its own
/// lifetime; only spawn failures are reported, through the failure
/// processor.
pub(crate) fn spawn_plugin(inner: &Arc<ManagerInner>, command: &str, port: u16, secret: &str) {
    let mut child = Command::new(command);
    child
        .arg("-pms-port")
        .arg(port.to_string())
        .arg("-pms-secret")
        .arg(secret)
        .stdin(Stdio::null());
    if inner.debug {
        child.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        child.stdout(Stdio::null()).stderr(Stdio::null());
    }

    match child.spawn() {
        Ok(mut child) => {
            log::info!("spawned plugin `{command}`");
            tokio::spawn(async move {
                // reap the child so it does not linger once it exits
                let _ = child.wait().await;
            });
        }
        Err(err) => inner.failure(ManagerError::Spawn {
            command: command.to_owned(),
            source: err,
        }),
    }
}
