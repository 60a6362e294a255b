use chrono::Utc;
use lab_orchestrator::{Caller, MachineState, Provisioner};
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub async fn start_janitor_task(provisioner: Provisioner, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));

    info!(interval_secs, "Janitor task running");

    loop {
        interval.tick().await;

        if let Err(e) = sweep_expired(&provisioner).await {
            error!("Janitor sweep failed: {}", e);
        }
    }
}

/// Tear down every machine whose expiry has passed, along with rows left
/// `pending` by a create that never finished. Returns how many were removed;
/// failures are logged and retried on the next sweep.
pub async fn sweep_expired(provisioner: &Provisioner) -> anyhow::Result<usize> {
    let expired = provisioner.expired_machines(Utc::now()).await?;
    let system = Caller::system();
    let mut removed = 0;

    for machine in expired {
        if machine.state == MachineState::Pending {
            info!(
                machine_id = %machine.id,
                owner = %machine.owner,
                last_update = %machine.updated_at,
                "Creation was abandoned, tearing it down"
            );
        } else {
            info!(
                machine_id = %machine.id,
                owner = %machine.owner,
                expired_at = %machine.expires_at,
                "Machine expired, tearing it down"
            );
        }

        match provisioner.delete_machine(&system, &machine.id).await {
            Ok(()) => removed += 1,
            Err(e) => error!(machine_id = %machine.id, "Failed to delete expired machine: {}", e),
        }
    }

    Ok(removed)
}
