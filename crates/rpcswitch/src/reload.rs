//! Runtime policy reload.
//!
//! SIGHUP re-reads the policy file and swaps the new snapshot into the
//! broker.  A policy that fails to load leaves the previous one in force;
//! connections and channels are never dropped by a reload.

use std::path::PathBuf;
use std::sync::Arc;

use rpcswitch_broker::{Broker, Policy};
use tracing::{info, warn};

/// Spawn the task that watches for SIGHUP and reloads the policy.
///
/// On platforms without SIGHUP this does nothing.
pub(crate) fn watch_for_policy_reload(
    broker: &Arc<Broker>,
    policy_path: PathBuf,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        let broker = Arc::clone(broker);
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("SIGHUP received; reloading policy from {}", policy_path.display());
                match Policy::load_path(&policy_path) {
                    Ok(policy) => broker.reload_policy(policy),
                    Err(e) => {
                        warn!("policy reload failed, keeping previous policy: {}", e);
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (broker, policy_path);
    }
    Ok(())
}
