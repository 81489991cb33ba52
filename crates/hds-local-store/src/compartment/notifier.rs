//! User-facing notices emitted when a non-empty compartment is purged.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CleanupReason {
    Manual,
    TimerExpired,
    Sweep,
    ExpiredOnRead,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::Manual => "manual",
            CleanupReason::TimerExpired => "timer",
            CleanupReason::Sweep => "sweep",
            CleanupReason::ExpiredOnRead => "expired_on_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupNotice {
    pub compartment_id: String,
    pub session_id: String,
    pub records_purged: usize,
    pub reason: CleanupReason,
}

impl CleanupNotice {
    pub fn message(&self) -> String {
        if self.records_purged == 1 {
            "1 temporary record was securely purged".to_string()
        } else {
            format!(
                "{} temporary records were securely purged",
                self.records_purged
            )
        }
    }
}

pub trait CleanupNotifier: Send + Sync {
    fn notify(&self, notice: CleanupNotice);
}

/// Default notifier: the notice goes to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl CleanupNotifier for TracingNotifier {
    fn notify(&self, notice: CleanupNotice) {
        info!(
            compartment = %notice.compartment_id,
            reason = notice.reason.as_str(),
            "{}",
            notice.message()
        );
    }
}

/// Forwards notices to a receiver, typically owned by the UI layer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<CleanupNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CleanupNotice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl CleanupNotifier for ChannelNotifier {
    fn notify(&self, notice: CleanupNotice) {
        if self.sender.send(notice).is_err() {
            debug!("Cleanup notice dropped: no subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(CleanupNotice {
            compartment_id: "cmp_1".into(),
            session_id: "s1".into(),
            records_purged: 3,
            reason: CleanupReason::Manual,
        });

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.records_purged, 3);
        assert_eq!(notice.message(), "3 temporary records were securely purged");
    }

    #[test]
    fn test_channel_notifier_without_subscriber() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(CleanupNotice {
            compartment_id: "cmp_1".into(),
            session_id: "s1".into(),
            records_purged: 1,
            reason: CleanupReason::Sweep,
        });
    }
}
