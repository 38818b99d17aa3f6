//! Unit tests for the notification entity, status machine, and wire record.

use chrono::{DateTime, TimeZone, Utc};
use rstest::{fixture, rstest};

use super::*;

#[fixture]
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 26, 12, 0, 0)
        .single()
        .expect("valid fixture time")
}

#[fixture]
fn notification(now: DateTime<Utc>) -> Notification {
    Notification::new(
        NewNotification {
            id: None,
            payload: b"hello".to_vec(),
            target: "ops@example.com".to_owned(),
            channel: Channel::email(),
            scheduled_at: now + chrono::TimeDelta::minutes(5),
        },
        now,
    )
}

#[rstest]
fn new_notifications_start_pending(notification: Notification, now: DateTime<Utc>) {
    assert_eq!(notification.status, NotificationStatus::Pending);
    assert_eq!(notification.retry_count, 0);
    assert_eq!(notification.created_at, now);
    assert_eq!(notification.updated_at, now);
    assert!(notification.last_error.is_none());
}

#[rstest]
fn caller_supplied_ids_are_kept(now: DateTime<Utc>) {
    let id = NotificationId::random();
    let notification = Notification::new(
        NewNotification {
            id: Some(id),
            payload: Vec::new(),
            target: "42".to_owned(),
            channel: Channel::telegram(),
            scheduled_at: now,
        },
        now,
    );
    assert_eq!(notification.id, id);
}

#[rstest]
#[case("email", true)]
#[case("telegram", true)]
#[case("sms-gateway_2", true)]
#[case("", false)]
#[case("Email", false)]
#[case("push notifications", false)]
fn channel_names_are_validated(#[case] name: &str, #[case] valid: bool) {
    assert_eq!(Channel::new(name).is_ok(), valid);
}

#[rstest]
#[case(NotificationStatus::Pending, "pending")]
#[case(NotificationStatus::InProcess, "in_process")]
#[case(NotificationStatus::Sent, "sent")]
#[case(NotificationStatus::Failed, "failed")]
#[case(NotificationStatus::Canceled, "canceled")]
fn status_strings_parse_back(#[case] status: NotificationStatus, #[case] text: &str) {
    assert_eq!(status.as_str(), text);
    assert_eq!(text.parse::<NotificationStatus>(), Ok(status));
}

#[rstest]
fn unknown_status_strings_are_rejected() {
    let err = "delivered".parse::<NotificationStatus>().expect_err("unknown status");
    assert_eq!(err.input, "delivered");
}

#[rstest]
#[case(NotificationStatus::Pending, NotificationStatus::InProcess, true)]
#[case(NotificationStatus::InProcess, NotificationStatus::InProcess, true)]
#[case(NotificationStatus::InProcess, NotificationStatus::Sent, true)]
#[case(NotificationStatus::InProcess, NotificationStatus::Pending, true)]
#[case(NotificationStatus::InProcess, NotificationStatus::Failed, true)]
#[case(NotificationStatus::Pending, NotificationStatus::Canceled, true)]
#[case(NotificationStatus::Failed, NotificationStatus::Canceled, true)]
#[case(NotificationStatus::Pending, NotificationStatus::Sent, false)]
#[case(NotificationStatus::Sent, NotificationStatus::Pending, false)]
#[case(NotificationStatus::Sent, NotificationStatus::Canceled, false)]
#[case(NotificationStatus::Canceled, NotificationStatus::Pending, false)]
#[case(NotificationStatus::Canceled, NotificationStatus::InProcess, false)]
fn lifecycle_transitions(
    #[case] from: NotificationStatus,
    #[case] to: NotificationStatus,
    #[case] allowed: bool,
) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[rstest]
fn wire_record_reproduces_every_field(mut notification: Notification, now: DateTime<Utc>) {
    notification.status = NotificationStatus::Pending;
    notification.payload = vec![0, 159, 146, 150, 255];
    notification.retry_count = 2;
    notification.last_error = Some("smtp 451".to_owned());
    notification.updated_at = now + chrono::TimeDelta::nanoseconds(123_456_789);

    let bytes = NotificationEnvelope::encode(&notification).expect("encode");
    let decoded = Notification::from(NotificationEnvelope::decode(&bytes).expect("decode"));

    assert_eq!(decoded, notification);
}

#[rstest]
fn wire_record_uses_snake_case_fields(notification: Notification) {
    let bytes = NotificationEnvelope::encode(&notification).expect("encode");
    let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

    assert_eq!(value["status"], "pending");
    assert_eq!(value["channel"], "email");
    assert_eq!(value["payload"], "aGVsbG8=");
    assert_eq!(value["retry_count"], 0);
}

#[rstest]
#[case(b"not json".as_slice())]
#[case(br#"{"id":"3fa85f64-5717-4562-b3fc-2c963f66afa6"}"#.as_slice())]
#[case(br#"{"id":"nope","payload":"","target":"","channel":"email","status":"pending","scheduled_at":"2026-02-26T12:00:00Z","created_at":"2026-02-26T12:00:00Z","updated_at":"2026-02-26T12:00:00Z","retry_count":0}"#.as_slice())]
fn malformed_records_are_rejected(#[case] bytes: &[u8]) {
    assert!(matches!(
        NotificationEnvelope::decode(bytes),
        Err(WireFormatError::Malformed { .. })
    ));
}
