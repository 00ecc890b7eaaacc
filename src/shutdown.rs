use futures::future;
use tokio::sync::watch;

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}
