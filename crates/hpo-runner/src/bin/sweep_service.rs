use std::sync::Arc;

use hpo_runner::{RunnerConfig, SimulatedConfig, SimulatedExecutor, SweepRunner};
use hpo_store::{FileStore, SweepStore};
use hpo_types::{HpoError, SweepError, SweepRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunnerConfig::from_env()?;
    let store = Arc::new(match std::env::var("HPO_DATA_DIR") {
        Ok(dir) => FileStore::new(dir)?,
        Err(_) => FileStore::default_location()?,
    });
    info!(root = %store.root().display(), "sweep service starting");

    let executor = Arc::new(SimulatedExecutor::new(store.clone(), SimulatedConfig::default()));
    let (events_tx, events_rx) = config.event_channel();
    let runner = SweepRunner::new(store.clone(), executor, config, events_tx)?;

    if let Ok(path) = std::env::var("HPO_SWEEP_FILE") {
        let requests: Vec<SweepRequest> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        for request in requests {
            match runner.submit(request) {
                Ok(sweep_id) => info!(sweep = %sweep_id, "submitted"),
                Err(HpoError::Sweep(SweepError::AlreadyRunning { sweep_id })) => {
                    warn!(sweep = %sweep_id, "already running, resuming instead")
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let event_log = std::thread::spawn(move || {
        for event in events_rx {
            info!(?event, "runner event");
        }
    });

    let passes = runner.run_until_idle().await?;
    info!(passes, "runner idle");

    for sweep_id in store.list_sweeps()? {
        let summary = runner.summary(&sweep_id)?;
        println!("{}", serde_json::to_string(&summary)?);
    }

    drop(runner);
    if let Err(panic) = event_log.join() {
        anyhow::bail!("event log thread panicked: {}", panic_message(&*panic));
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_is_readable() {
        let literal = std::thread::spawn(|| panic!("channel closed")).join().unwrap_err();
        assert_eq!(panic_message(&*literal), "channel closed");

        let formatted = std::thread::spawn(|| panic!("event {}", 7)).join().unwrap_err();
        assert_eq!(panic_message(&*formatted), "event 7");

        let other = std::thread::spawn(|| std::panic::panic_any(42u8)).join().unwrap_err();
        assert_eq!(panic_message(&*other), "non-string payload");
    }
}
