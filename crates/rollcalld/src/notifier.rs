use rollcall_core::gate::{Notification, Notifier, NotifyError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queues notifications for a background delivery task.
///
/// `notify` never waits: a full queue or a stopped task is reported as an
/// error to the caller, which logs it and moves on.
#[derive(Clone)]
pub struct OutboxNotifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier for OutboxNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

/// Start the delivery task. It exits once every `OutboxNotifier` is dropped.
pub fn spawn_outbox(capacity: usize) -> (OutboxNotifier, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
    let handle = tokio::spawn(async move {
        tracing::info!(capacity, "notification outbox started");
        while let Some(n) = rx.recv().await {
            if let Err(e) = deliver(&n) {
                tracing::warn!(error = %e, identity_id = %n.identity_id, "notification dropped");
            }
        }
        tracing::info!("notification outbox drained");
    });
    (OutboxNotifier { tx }, handle)
}

// No transport is wired in; delivery is the structured log line.
fn deliver(n: &Notification) -> Result<(), NotifyError> {
    let address = n.contact_address.trim();
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => {
            return Err(NotifyError::Delivery(format!(
                "unusable contact address {address:?}"
            )))
        }
    }
    tracing::info!(
        to = %n.contact_address,
        identity_id = %n.identity_id,
        date = %n.date,
        subject = Notification::SUBJECT,
        body = %n.body(),
        "notification sent"
    );
    Ok(())
}
