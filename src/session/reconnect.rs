use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{LinkConnector, RemoteSession};

const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Tries to re-establish a broken session within the configured window,
///  doubling the delay between attempts. Fires `pre_reconnect` before the
///  first attempt and `reconnect_success` after a successful one; exhausting
///  the window invalidates the session and fires its disconnect event.
///
/// Pending rpc entries are deliberately left alone: they resolve when the
///  re-established peer answers, or through the timeout sweeper.
pub(crate) async fn run_supervisor(session: Arc<RemoteSession>, connector: Arc<dyn LinkConnector>) {
    session.notify_pre_reconnect();

    let deadline = Instant::now() + session.context().config().reconnect_window;
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0usize;

    loop {
        if !session.is_reconnecting() {
            // the session was disconnected (or re-established) underneath us
            debug!("session {}: reconnect obsolete - stopping supervisor", session.id());
            return;
        }

        attempt += 1;
        match connector.establish(&session).await {
            Ok(()) => {
                info!("session {}: reconnected after {} attempt(s)", session.id(), attempt);
                session.notify_reconnect_success();
                return;
            }
            Err(e) => {
                debug!("session {}: reconnect attempt {} failed: {}", session.id(), attempt, e);
            }
        }

        if Instant::now() + delay >= deadline {
            break;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }

    warn!("session {}: reconnect window exhausted after {} attempt(s)", session.id(), attempt);
    session.finalize_failed_reconnect();
}
