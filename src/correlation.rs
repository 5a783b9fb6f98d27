//! Command lifecycle: `pending → sent → {delivered | failed}`.
//!
//! Commands are keyed by `(device_id, internal_log_id)`. Results arrive on
//! the device connection or through the HTTP delivery-report path; both go
//! through [`Correlator`], which refuses any transition the state machine does
//! not allow. Re-applying a result to a terminal command is a no-op, so
//! duplicate reports are harmless.
//!
//! Nothing here times out or retries. A command whose connection vanished
//! before `sent` stays `pending` until an external caller acts.

use std::sync::Arc;

use tracing::{debug, info};

use crate::models::{
    CommandDetail, CommandKind, CommandState, InternalLogId, PendingCommand,
};
use crate::protocol::DeliveryStatus;
use crate::store::{Store, StoreError};
use crate::util::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("no command {internal_log_id} for device {device_id}")]
    NotFound {
        device_id: String,
        internal_log_id: InternalLogId,
    },
    #[error("command {internal_log_id} is a {actual:?} command, expected {expected:?}")]
    KindMismatch {
        internal_log_id: InternalLogId,
        expected: CommandKind,
        actual: CommandKind,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether an update changed the stored command.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(PendingCommand),
    Unchanged(PendingCommand),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn command(&self) -> &PendingCommand {
        match self {
            Self::Applied(c) | Self::Unchanged(c) => c,
        }
    }
}

/// Terminal result reported by the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub success: bool,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct Correlator {
    store: Arc<dyn Store>,
}

impl Correlator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a new `pending` command before anything goes on the wire.
    pub async fn open(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        detail: CommandDetail,
    ) -> Result<PendingCommand, CorrelationError> {
        let command = PendingCommand::new(device_id, internal_log_id, detail, now_ms());
        self.store.insert_command(command.clone()).await?;
        debug!(device_id, internal_log_id, kind = ?command.kind(), "Command opened");
        Ok(command)
    }

    /// The hub accepted the frame into a live connection's buffer.
    pub async fn mark_sent(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
    ) -> Result<Transition, CorrelationError> {
        self.transition(device_id, internal_log_id, None, CommandState::Sent, |_| {})
            .await
    }

    /// The command could not be handed to a connection.
    pub async fn mark_failed(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        error: &str,
    ) -> Result<Transition, CorrelationError> {
        self.transition(device_id, internal_log_id, None, CommandState::Failed, |c| {
            c.error_message = Some(error.to_string());
        })
        .await
    }

    /// Apply a USSD or phone-discovery result.
    pub async fn complete(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        kind: CommandKind,
        completion: Completion,
    ) -> Result<Transition, CorrelationError> {
        let next = if completion.success {
            CommandState::Delivered
        } else {
            CommandState::Failed
        };
        self.transition(device_id, internal_log_id, Some(kind), next, move |c| {
            c.result = completion.result;
            c.error_message = completion.error_message;
        })
        .await
    }

    /// Apply an SMS delivery report. Intermediate statuses are only logged.
    pub async fn apply_delivery_report(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        status: DeliveryStatus,
        report: &str,
        error_message: Option<&str>,
    ) -> Result<Transition, CorrelationError> {
        let next = match status {
            DeliveryStatus::Delivered => CommandState::Delivered,
            DeliveryStatus::Failed => CommandState::Failed,
            DeliveryStatus::InProgress => {
                let command = self.load(device_id, internal_log_id).await?;
                info!(device_id, internal_log_id, report, "Intermediate delivery report");
                return Ok(Transition::Unchanged(command));
            }
        };
        self.transition(
            device_id,
            internal_log_id,
            Some(CommandKind::Sms),
            next,
            |c| {
                c.delivery_report = Some(report.to_string());
                if let Some(err) = error_message.filter(|e| !e.is_empty()) {
                    c.error_message = Some(err.to_string());
                }
            },
        )
        .await
    }

    async fn load(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
    ) -> Result<PendingCommand, CorrelationError> {
        self.store
            .command(device_id, internal_log_id)
            .await?
            .ok_or_else(|| CorrelationError::NotFound {
                device_id: device_id.to_string(),
                internal_log_id,
            })
    }

    async fn transition(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        expected: Option<CommandKind>,
        next: CommandState,
        update: impl FnOnce(&mut PendingCommand),
    ) -> Result<Transition, CorrelationError> {
        let mut command = self.load(device_id, internal_log_id).await?;
        if let Some(expected) = expected {
            if command.kind() != expected {
                return Err(CorrelationError::KindMismatch {
                    internal_log_id,
                    expected,
                    actual: command.kind(),
                });
            }
        }
        if !command.state.can_transition_to(next) {
            debug!(
                device_id,
                internal_log_id,
                state = command.state.as_str(),
                next = next.as_str(),
                "Ignoring transition"
            );
            return Ok(Transition::Unchanged(command));
        }

        let now = now_ms();
        command.state = next;
        if next == CommandState::Sent {
            command.sent_at = Some(now);
        }
        if next.is_terminal() {
            command.completed_at = Some(now);
        }
        update(&mut command);
        self.store.save_command(command.clone()).await?;
        info!(device_id, internal_log_id, state = next.as_str(), "Command state changed");
        Ok(Transition::Applied(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sms_detail() -> CommandDetail {
        CommandDetail::Sms {
            target: "+905551112233".into(),
            message: "hi".into(),
            sim_slot: 0,
        }
    }

    fn correlator() -> (Correlator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Correlator::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_happy_path_pending_sent_delivered() {
        let (c, store) = correlator();
        let opened = c.open("DEV1", 1, sms_detail()).await.unwrap();
        assert_eq!(opened.state, CommandState::Pending);

        assert!(c.mark_sent("DEV1", 1).await.unwrap().is_applied());
        let t = c
            .apply_delivery_report("DEV1", 1, DeliveryStatus::Delivered, "stat:DELIVRD", None)
            .await
            .unwrap();
        assert!(t.is_applied());

        let stored = store.command("DEV1", 1).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Delivered);
        assert!(stored.sent_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.delivery_report.as_deref(), Some("stat:DELIVRD"));
    }

    #[tokio::test]
    async fn test_delivery_report_is_idempotent() {
        let (c, store) = correlator();
        c.open("DEV1", 5, sms_detail()).await.unwrap();
        c.mark_sent("DEV1", 5).await.unwrap();

        let first = c
            .apply_delivery_report("DEV1", 5, DeliveryStatus::Delivered, "r", None)
            .await
            .unwrap();
        let after_first = store.command("DEV1", 5).await.unwrap().unwrap();

        let second = c
            .apply_delivery_report("DEV1", 5, DeliveryStatus::Delivered, "r", None)
            .await
            .unwrap();
        let after_second = store.command("DEV1", 5).await.unwrap().unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.completed_at, after_first.completed_at);
    }

    #[tokio::test]
    async fn test_terminal_state_absorbs_contradicting_report() {
        let (c, store) = correlator();
        c.open("DEV1", 2, sms_detail()).await.unwrap();
        c.apply_delivery_report("DEV1", 2, DeliveryStatus::Failed, "UNDELIV", Some("no route"))
            .await
            .unwrap();
        let t = c
            .apply_delivery_report("DEV1", 2, DeliveryStatus::Delivered, "DELIVRD", None)
            .await
            .unwrap();
        assert!(!t.is_applied());
        let stored = store.command("DEV1", 2).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("no route"));
        // A late sent confirmation does not resurrect it either.
        assert!(!c.mark_sent("DEV1", 2).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_result_before_sent_is_accepted() {
        let (c, _store) = correlator();
        c.open(
            "DEV1",
            3,
            CommandDetail::Ussd {
                ussd_code: "*100#".into(),
                sim_slot: 0,
            },
        )
        .await
        .unwrap();
        let t = c
            .complete(
                "DEV1",
                3,
                CommandKind::Ussd,
                Completion {
                    success: true,
                    result: Some("Balance 10 TL".into()),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(t.command().state, CommandState::Delivered);
        assert_eq!(t.command().result.as_deref(), Some("Balance 10 TL"));
        assert!(!c.mark_sent("DEV1", 3).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_in_progress_report_changes_nothing() {
        let (c, store) = correlator();
        c.open("DEV1", 4, sms_detail()).await.unwrap();
        c.mark_sent("DEV1", 4).await.unwrap();
        let t = c
            .apply_delivery_report("DEV1", 4, DeliveryStatus::InProgress, "ENROUTE", None)
            .await
            .unwrap();
        assert!(!t.is_applied());
        let stored = store.command("DEV1", 4).await.unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Sent);
        assert!(stored.delivery_report.is_none());
    }

    #[tokio::test]
    async fn test_unknown_command_and_kind_mismatch() {
        let (c, _store) = correlator();
        assert!(matches!(
            c.mark_sent("DEV1", 99).await,
            Err(CorrelationError::NotFound { .. })
        ));
        c.open("DEV1", 6, sms_detail()).await.unwrap();
        assert!(matches!(
            c.complete("DEV1", 6, CommandKind::Ussd, Completion::default())
                .await,
            Err(CorrelationError::KindMismatch { .. })
        ));
        // Correlation is scoped per device.
        assert!(matches!(
            c.mark_sent("DEV2", 6).await,
            Err(CorrelationError::NotFound { .. })
        ));
    }
}
