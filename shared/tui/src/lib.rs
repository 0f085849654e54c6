mod logging;
mod progress;

pub use logging::{logging, LogOutput, LoggingBuilder};
pub use progress::training_progress_bar;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Returns a token that is cancelled on the first Ctrl-C.
///
/// Must be called from inside a tokio runtime.
pub fn setup_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Got Ctrl-C, stopping the run");
                cancel.cancel();
            }
        }
    });
    cancel
}
