//! Unit tests for the scheduler tick and loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::{Scheduler, SchedulerConfig, TickReport};
use crate::domain::ports::{
    DelayedQueueError, MockDelayedQueue, MockNotificationRepository, NotificationRepositoryError,
};
use crate::domain::{Channel, ExhaustedRetryCount, NotificationStatus, RetryPolicy};
use crate::test_support::notifications::{
    InMemoryNotificationRepository, MutableClock, RecordingQueue, pending_notification,
};

#[fixture]
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 26, 12, 0, 0)
        .single()
        .expect("valid fixture time")
}

struct Harness {
    clock: Arc<MutableClock>,
    repository: Arc<InMemoryNotificationRepository>,
    queue: Arc<RecordingQueue>,
    scheduler: Scheduler,
}

fn harness(now: DateTime<Utc>, retry_policy: RetryPolicy) -> Harness {
    let clock = Arc::new(MutableClock::new(now));
    let repository = Arc::new(InMemoryNotificationRepository::new(clock.clone()));
    let queue = Arc::new(RecordingQueue::new());
    let scheduler = Scheduler::new(
        repository.clone(),
        queue.clone(),
        clock.clone(),
        retry_policy,
        SchedulerConfig {
            poll_interval: Duration::from_millis(50),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(300),
        },
    );
    Harness {
        clock,
        repository,
        queue,
        scheduler,
    }
}

#[rstest]
#[tokio::test]
async fn due_rows_are_claimed_and_published_in_schedule_order(now: DateTime<Utc>) {
    let h = harness(now, RetryPolicy::default());
    let later = pending_notification(Channel::email(), now - TimeDelta::seconds(5), now);
    let earlier = pending_notification(Channel::email(), now - TimeDelta::seconds(30), now);
    let future = pending_notification(Channel::email(), now + TimeDelta::minutes(5), now);
    for n in [&later, &earlier, &future] {
        h.repository.insert(n.clone());
    }

    let report = h.scheduler.tick().await;

    assert_eq!(report.claimed, 2);
    assert_eq!(report.published, 2);
    assert_eq!(
        h.queue.published(),
        vec![(earlier.id, Duration::ZERO), (later.id, Duration::ZERO)]
    );
    let claimed = h.repository.row(&earlier.id).expect("row");
    assert_eq!(claimed.status, NotificationStatus::InProcess);
    assert_eq!(
        h.repository.row(&future.id).expect("row").status,
        NotificationStatus::Pending
    );
}

#[rstest]
#[tokio::test]
async fn publish_delay_is_time_until_due(now: DateTime<Utc>) {
    let h = harness(now, RetryPolicy::default());
    let notification = pending_notification(Channel::email(), now + TimeDelta::seconds(90), now);
    h.repository.insert(notification.clone());
    h.clock.advance_seconds(100);
    // Claimed late: nothing left to wait for.
    h.scheduler.tick().await;
    assert_eq!(h.queue.published(), vec![(notification.id, Duration::ZERO)]);
}

#[rstest]
#[tokio::test]
async fn claimed_rows_stay_in_process_until_visibility_timeout(now: DateTime<Utc>) {
    let h = harness(now, RetryPolicy::default());
    let notification = pending_notification(Channel::email(), now, now);
    h.repository.insert(notification.clone());

    assert_eq!(h.scheduler.tick().await.claimed, 1);
    h.clock.advance_seconds(299);
    assert_eq!(h.scheduler.tick().await.claimed, 0);
    h.clock.advance_seconds(1);
    assert_eq!(h.scheduler.tick().await.claimed, 1);
    assert_eq!(h.queue.published().len(), 2);
}

#[rstest]
#[tokio::test]
async fn publish_failure_with_budget_left_returns_row_to_pending(now: DateTime<Utc>) {
    let h = harness(now, RetryPolicy::new(3, ExhaustedRetryCount::Preserve));
    let failing = pending_notification(Channel::email(), now, now);
    let healthy = pending_notification(Channel::email(), now, now);
    h.repository.insert(failing.clone());
    h.repository.insert(healthy.clone());
    h.queue.reject(failing.id);

    let report = h.scheduler.tick().await;

    assert_eq!(report.published, 1);
    assert_eq!(report.requeued, 1);
    let row = h.repository.row(&failing.id).expect("row");
    assert_eq!(row.status, NotificationStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.scheduled_at, failing.scheduled_at);
    assert!(
        row.last_error
            .as_deref()
            .is_some_and(|message| message.contains("broker connection lost"))
    );
    assert_eq!(
        h.repository.row(&healthy.id).expect("row").status,
        NotificationStatus::InProcess
    );
}

#[rstest]
#[case(ExhaustedRetryCount::Preserve, 3)]
#[case(ExhaustedRetryCount::Reset, 0)]
#[tokio::test]
async fn publish_failure_at_budget_marks_row_failed(
    now: DateTime<Utc>,
    #[case] exhausted: ExhaustedRetryCount,
    #[case] expected_count: u32,
) {
    let h = harness(now, RetryPolicy::new(3, exhausted));
    let mut notification = pending_notification(Channel::email(), now, now);
    notification.retry_count = 3;
    h.repository.insert(notification.clone());
    h.queue.reject(notification.id);

    let report = h.scheduler.tick().await;

    assert_eq!(report.failed, 1);
    let row = h.repository.row(&notification.id).expect("row");
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, expected_count);
    assert!(row.last_error.is_some());
}

#[rstest]
#[tokio::test]
async fn claim_failure_skips_the_tick(now: DateTime<Utc>) {
    let mut repository = MockNotificationRepository::new();
    repository
        .expect_claim_ready()
        .times(1)
        .returning(|_, _| Err(NotificationRepositoryError::connection("refused")));
    repository.expect_update_status().never();
    let mut queue = MockDelayedQueue::new();
    queue.expect_publish().never();

    let scheduler = Scheduler::new(
        Arc::new(repository),
        Arc::new(queue),
        Arc::new(MutableClock::new(now)),
        RetryPolicy::default(),
        SchedulerConfig::default(),
    );

    let report = scheduler.tick().await;

    assert_eq!(
        report,
        TickReport {
            claim_failed: true,
            ..TickReport::default()
        }
    );
}

#[rstest]
#[tokio::test]
async fn reconcile_failure_does_not_abort_the_batch(now: DateTime<Utc>) {
    let first = pending_notification(Channel::email(), now - TimeDelta::seconds(2), now);
    let second = pending_notification(Channel::email(), now - TimeDelta::seconds(1), now);
    let claimed = vec![first.clone(), second.clone()];
    let first_id = first.id;

    let mut repository = MockNotificationRepository::new();
    repository
        .expect_claim_ready()
        .return_once(move |_, _| Ok(claimed));
    repository
        .expect_update_status()
        .times(1)
        .returning(|update| Err(NotificationRepositoryError::not_found(update.id)));
    let mut queue = MockDelayedQueue::new();
    queue
        .expect_publish()
        .times(2)
        .returning(move |notification, _| {
            if notification.id == first_id {
                Err(DelayedQueueError::unavailable("channel closed"))
            } else {
                Ok(())
            }
        });

    let scheduler = Scheduler::new(
        Arc::new(repository),
        Arc::new(queue),
        Arc::new(MutableClock::new(now)),
        RetryPolicy::default(),
        SchedulerConfig::default(),
    );

    let report = scheduler.tick().await;

    assert_eq!(report.claimed, 2);
    assert_eq!(report.published, 1);
    assert_eq!(report.reconcile_errors, 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn run_polls_until_cancelled(now: DateTime<Utc>) {
    let h = Arc::new(harness(now, RetryPolicy::default()));
    let shutdown = CancellationToken::new();
    let task = {
        let h = h.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { h.scheduler.run(shutdown).await })
    };

    let notification = pending_notification(Channel::email(), now, now);
    h.repository.insert(notification.clone());
    tokio::time::sleep(Duration::from_millis(120)).await;
    shutdown.cancel();
    task.await.expect("scheduler task");

    assert_eq!(h.queue.published(), vec![(notification.id, Duration::ZERO)]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn zero_poll_interval_is_raised_to_minimum(now: DateTime<Utc>) {
    let clock = Arc::new(MutableClock::new(now));
    let repository = Arc::new(InMemoryNotificationRepository::new(clock.clone()));
    let queue = Arc::new(RecordingQueue::new());
    let scheduler = Scheduler::new(
        repository.clone(),
        queue.clone(),
        clock,
        RetryPolicy::default(),
        SchedulerConfig {
            poll_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        },
    );
    let notification = pending_notification(Channel::email(), now, now);
    repository.insert(notification.clone());

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let run = scheduler.run(shutdown);
    let cancel = async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.cancel();
    };
    tokio::join!(run, cancel);

    assert_eq!(queue.published(), vec![(notification.id, Duration::ZERO)]);
}
