pub mod backends;
pub mod builders;
pub mod processors;

use std::sync::Once;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt};
use viztrail::viztrail::{ModuleState, ModuleTransition};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs go through `with_test_writer()`, so the harness only shows them for
/// failing tests (or with `-- --nocapture`). Pick levels with `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Next broadcast transition into `state`. Subscribe before triggering it.
pub async fn next_transition_to(
    events: &mut broadcast::Receiver<ModuleTransition>,
    state: ModuleState,
) -> ModuleTransition {
    with_timeout(async {
        loop {
            match events.recv().await {
                Ok(t) if t.to == state => return t,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("engine event channel closed"),
            }
        }
    })
    .await
}
