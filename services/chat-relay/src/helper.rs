//! Optional co-located challenge helper process
//!
//! When enabled in config, the relay spawns the helper binary that solves
//! browser challenges and serves them on the local clearance port. The child
//! is tied to the relay's lifetime via kill-on-drop.

use tokio::process::{Child, Command};
use tracing::info;

pub struct HelperProcess {
    child: Child,
}

impl HelperProcess {
    /// Spawn the helper serving the clearance endpoint on `port`.
    pub fn spawn(command: &str, port: u16) -> std::io::Result<Self> {
        let child = Command::new(command)
            .arg("--port")
            .arg(port.to_string())
            .kill_on_drop(true)
            .spawn()?;
        info!(command, port, pid = child.id(), "challenge helper spawned");
        Ok(Self { child })
    }

    /// Terminate the helper. Also happens implicitly on drop.
    pub async fn shutdown(mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::warn!(%err, "failed to kill challenge helper");
        }
    }
}
