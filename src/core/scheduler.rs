//! Delayed, cancelable notification timers for pending human decisions.
//!
//! Every scheduled task carries the audit id it belongs to and is indexed
//! by it, so one cancellation call stops every outstanding reminder,
//! escalation, and recurring admin task tied to a decision. Timers run as
//! independent tokio tasks and never block event processing; cancellation
//! aborts the task at its sleep point, so a cancel-then-fire cannot occur
//! (one send already in flight when cancellation lands is acceptable).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::CommunicationBackend;

/// What a scheduled task will do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    /// One-shot nudge to the requestor
    Reminder,

    /// One-shot escalation to a supervisor
    Escalation,

    /// Self-rescheduling admin reminder
    AdminRecurring,
}

struct Scheduled {
    task_id: Uuid,
    kind: ReminderKind,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    backend: Arc<dyn CommunicationBackend>,
    tasks: Mutex<HashMap<Uuid, Vec<Scheduled>>>,
}

impl SchedulerInner {
    fn remove_task(&self, audit_id: Uuid, task_id: Uuid) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = tasks.get_mut(&audit_id) {
            list.retain(|s| s.task_id != task_id);
            if list.is_empty() {
                tasks.remove(&audit_id);
            }
        }
    }
}

/// Reminder, escalation, and recurring admin notification scheduler.
pub struct ReminderScheduler {
    inner: Arc<SchedulerInner>,
}

impl ReminderScheduler {
    pub fn new(backend: Arc<dyn CommunicationBackend>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backend,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Schedule a one-shot reminder tied to `audit_id`. Returns the task id.
    pub fn schedule_reminder(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        delay: Duration,
        audit_id: Uuid,
    ) -> Uuid {
        self.schedule_one_shot(ReminderKind::Reminder, recipient, subject, body, delay, audit_id)
    }

    /// Schedule a one-shot escalation tied to `audit_id`.
    pub fn schedule_escalation(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        delay: Duration,
        audit_id: Uuid,
    ) -> Uuid {
        self.schedule_one_shot(
            ReminderKind::Escalation,
            recipient,
            subject,
            body,
            delay,
            audit_id,
        )
    }

    fn schedule_one_shot(
        &self,
        kind: ReminderKind,
        recipient: &str,
        subject: &str,
        body: &str,
        delay: Duration,
        audit_id: Uuid,
    ) -> Uuid {
        let task_id = Uuid::new_v4();
        let inner = self.inner.clone();
        let recipient = recipient.to_string();
        let subject = subject.to_string();
        let body = body.to_string();

        let handle = tokio::spawn({
            let inner = inner.clone();
            async move {
                tokio::time::sleep(delay).await;

                match inner.backend.send_email(&recipient, &subject, &body).await {
                    Ok(_) => debug!(%audit_id, ?kind, "Notification sent"),
                    Err(e) => warn!(%audit_id, ?kind, error = %e, "Notification send failed"),
                }

                inner.remove_task(audit_id, task_id);
            }
        });

        self.track(audit_id, Scheduled { task_id, kind, handle });
        task_id
    }

    /// Schedule an admin reminder that re-fires every `interval` until the
    /// audit is resolved. A canceled task never schedules another iteration.
    pub fn schedule_admin_recurring_reminders(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        interval: Duration,
        audit_id: Uuid,
    ) -> Uuid {
        let task_id = Uuid::new_v4();
        let inner = self.inner.clone();
        let recipient = recipient.to_string();
        let subject = subject.to_string();
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                // A failed send is logged and the task still reschedules.
                match inner.backend.send_email(&recipient, &subject, &body).await {
                    Ok(_) => debug!(%audit_id, "Admin reminder sent"),
                    Err(e) => warn!(%audit_id, error = %e, "Admin reminder send failed"),
                }
            }
        });

        self.track(
            audit_id,
            Scheduled {
                task_id,
                kind: ReminderKind::AdminRecurring,
                handle,
            },
        );
        task_id
    }

    fn track(&self, audit_id: Uuid, scheduled: Scheduled) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.entry(audit_id).or_default().push(scheduled);
    }

    /// Abort every outstanding task tied to `audit_id`. Returns how many
    /// tasks were stopped.
    pub fn cancel_for_audit(&self, audit_id: Uuid) -> usize {
        let removed = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&audit_id)
        };

        match removed {
            Some(list) => {
                let count = list.len();
                for scheduled in list {
                    debug!(%audit_id, kind = ?scheduled.kind, "Aborting scheduled task");
                    scheduled.handle.abort();
                }
                info!(%audit_id, count, "Canceled scheduled notifications");
                count
            }
            None => 0,
        }
    }

    /// Abort every outstanding task. Used at shutdown.
    pub fn cancel_pending(&self) -> usize {
        let drained: Vec<Scheduled> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().flat_map(|(_, list)| list).collect()
        };

        let count = drained.len();
        for scheduled in drained {
            scheduled.handle.abort();
        }

        if count > 0 {
            info!(count, "Canceled all scheduled notifications");
        }
        count
    }

    /// Outstanding (unfired or recurring) task count.
    pub fn pending_count(&self) -> usize {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .flat_map(|list| list.iter())
            .filter(|s| !s.handle.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::CalendarEvent;

    struct CountingBackend {
        sent: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
            })
        }

        fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommunicationBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn request_confirmation(
            &self,
            _contact: &str,
            _subject: &str,
            _body: &str,
            _event: &CalendarEvent,
            _info: &BTreeMap<String, String>,
            _context: Option<&Value>,
        ) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn send_email(&self, _recipient: &str, _subject: &str, _body: &str) -> Result<bool> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_fires_after_delay() {
        let backend = CountingBackend::new();
        let scheduler = ReminderScheduler::new(backend.clone());
        let audit_id = Uuid::new_v4();

        scheduler.schedule_reminder("a@x", "subj", "body", Duration::from_secs(60), audit_id);
        assert_eq!(backend.sent(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(backend.sent(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire_suppresses_send() {
        let backend = CountingBackend::new();
        let scheduler = ReminderScheduler::new(backend.clone());
        let audit_id = Uuid::new_v4();

        scheduler.schedule_reminder("a@x", "subj", "body", Duration::from_secs(60), audit_id);
        scheduler.schedule_escalation("b@x", "subj", "body", Duration::from_secs(120), audit_id);

        let canceled = scheduler.cancel_for_audit(audit_id);
        assert_eq!(canceled, 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        settle().await;

        assert_eq!(backend.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_reschedules_until_canceled() {
        let backend = CountingBackend::new();
        let scheduler = ReminderScheduler::new(backend.clone());
        let audit_id = Uuid::new_v4();

        scheduler.schedule_admin_recurring_reminders(
            "admin@x",
            "subj",
            "body",
            Duration::from_secs(3600),
            audit_id,
        );

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            settle().await;
        }
        assert_eq!(backend.sent(), 3);

        scheduler.cancel_for_audit(audit_id);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        settle().await;

        assert_eq!(backend.sent(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_stops_everything() {
        let backend = CountingBackend::new();
        let scheduler = ReminderScheduler::new(backend.clone());

        scheduler.schedule_reminder("a@x", "s", "b", Duration::from_secs(60), Uuid::new_v4());
        scheduler.schedule_admin_recurring_reminders(
            "admin@x",
            "s",
            "b",
            Duration::from_secs(60),
            Uuid::new_v4(),
        );

        assert_eq!(scheduler.cancel_pending(), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;

        assert_eq!(backend.sent(), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_harmless() {
        let backend = CountingBackend::new();
        let scheduler = ReminderScheduler::new(backend.clone());
        let audit_id = Uuid::new_v4();

        scheduler.schedule_reminder("a@x", "s", "b", Duration::from_secs(10), audit_id);

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(backend.sent(), 1);

        // Fired tasks already removed themselves; cancel finds nothing
        assert_eq!(scheduler.cancel_for_audit(audit_id), 0);
    }
}
