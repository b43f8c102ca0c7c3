//! End-to-end room scenarios over the loopback transport.

mod common;

use std::time::Duration;

use meshroom_core::adapters::loopback::LoopbackHub;
use meshroom_core::domain::identity::PeerIdentity;
use meshroom_core::domain::session::{Role, SessionState};
use meshroom_core::{ErrorKind, SessionError};

use common::{host, init_test_logging, joiner, member_ids, settle};

#[tokio::test]
async fn host_membership_grows_when_joiner_arrives() {
    init_test_logging();
    let hub = LoopbackHub::new();
    let (mut h, h_events) = host(&hub, "12345", "Ana");
    let (mut j, _) = joiner(&hub, "12345", "Bob");

    let host_id = h.join().await.unwrap();
    assert_eq!(member_ids(&h), vec![host_id.clone()]);

    let joiner_id = j.join().await.unwrap();
    settle(&mut [&mut h, &mut j]);

    let mut expected = vec![host_id, joiner_id.clone()];
    expected.sort();
    assert_eq!(member_ids(&h), expected);
    assert_eq!(h_events.joins(), vec![(joiner_id, "Bob".to_owned())]);
}

#[tokio::test]
async fn first_message_carries_sequence_one_and_sender_name() {
    let hub = LoopbackHub::new();
    let (mut a, _) = host(&hub, "100", "Alice");
    let (mut b, b_events) = joiner(&hub, "100", "Bea");
    let a_id = a.join().await.unwrap();
    b.join().await.unwrap();
    settle(&mut [&mut a, &mut b]);

    a.send_message("hi");
    settle(&mut [&mut a, &mut b]);

    let messages = b_events.messages();
    assert_eq!(messages.len(), 1);
    let (message, from) = &messages[0];
    assert_eq!(message.content, "hi");
    assert_eq!(message.sequence, 1);
    assert_eq!(message.sender, "Alice");
    assert_eq!(from, &a_id);
}

#[tokio::test]
async fn sequences_increase_per_sender() {
    let hub = LoopbackHub::new();
    let (mut a, a_events) = host(&hub, "100", "Alice");
    let (mut b, b_events) = joiner(&hub, "100", "Bea");
    a.join().await.unwrap();
    b.join().await.unwrap();
    settle(&mut [&mut a, &mut b]);

    for i in 0..5 {
        a.send_message(format!("a{i}"));
        if i % 2 == 0 {
            b.send_message(format!("b{i}"));
        }
    }
    settle(&mut [&mut a, &mut b]);

    let from_a: Vec<u64> = b_events.messages().iter().map(|(m, _)| m.sequence).collect();
    let from_b: Vec<u64> = a_events.messages().iter().map(|(m, _)| m.sequence).collect();
    assert_eq!(from_a, vec![1, 2, 3, 4, 5]);
    assert_eq!(from_b, vec![1, 2, 3]);
}

#[tokio::test]
async fn joiner_sees_host_leave_exactly_once() {
    let hub = LoopbackHub::new();
    let (mut h, _) = host(&hub, "555", "Ana");
    let (mut j, j_events) = joiner(&hub, "555", "Bob");
    let host_id = h.join().await.unwrap();
    j.join().await.unwrap();
    settle(&mut [&mut h, &mut j]);

    h.leave().await;
    settle(&mut [&mut h, &mut j]);
    h.leave().await;
    settle(&mut [&mut h, &mut j]);

    assert_eq!(j_events.leaves(), vec![host_id.clone()]);
    assert!(!member_ids(&j).contains(&host_id));
    assert_eq!(hub.teardowns(), 1);
}

#[tokio::test]
async fn channel_error_reports_and_removes_member() {
    let hub = LoopbackHub::new();
    let (mut h, h_events) = host(&hub, "556", "Ana");
    let (mut j, _) = joiner(&hub, "556", "Bob");
    let host_id = h.join().await.unwrap();
    let joiner_id = j.join().await.unwrap();
    settle(&mut [&mut h, &mut j]);

    hub.fail_channel(&host_id, &joiner_id, "reset by peer");
    settle(&mut [&mut h, &mut j]);

    assert_eq!(h_events.errors(), vec![ErrorKind::Network]);
    assert_eq!(h_events.leaves(), vec![joiner_id]);
    // Channel failures are not terminal for the room.
    assert_eq!(h.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn identity_collisions_within_ceiling_are_invisible() {
    let hub = LoopbackHub::new();
    hub.reject_registrations(&"room-1".into(), 2);
    let (mut h, events) = host(&hub, "room-1", "Ana");

    let id = h.join().await.unwrap();
    assert_eq!(id, PeerIdentity::from("room-1"));
    assert_eq!(h.state(), SessionState::Connected);
    assert!(events.errors().is_empty());
    assert_eq!(hub.registration_attempts(&id), 3);
}

#[tokio::test(start_paused = true)]
async fn collisions_past_ceiling_fail_the_room() {
    let hub = LoopbackHub::new();
    hub.reject_registrations(&"room-1".into(), u32::MAX);
    let (mut h, events) = host(&hub, "room-1", "Ana");

    let err = h.join().await.unwrap_err();
    assert_eq!(err, SessionError::IdentityExhausted { attempts: 4 });
    assert_eq!(hub.registration_attempts(&"room-1".into()), 4);
    assert_eq!(h.state(), SessionState::Failed);
    assert_eq!(events.errors(), vec![ErrorKind::IdentityExhausted]);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_signaling_is_reported() {
    let hub = LoopbackHub::new();
    hub.set_signaling_responsive(false);
    let (mut h, events) = host(&hub, "1", "Ana");

    let err = h.join().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SignalingUnreachable);
    assert_eq!(events.errors(), vec![ErrorKind::SignalingUnreachable]);
    assert_eq!(h.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn joiner_times_out_when_dial_hangs() {
    let hub = LoopbackHub::new();
    let (mut h, _) = host(&hub, "900", "Ana");
    h.join().await.unwrap();
    hub.set_dial_responsive(false);

    let (mut j, events) = joiner(&hub, "900", "Bob");
    let err = j.join().await.unwrap_err();
    assert_eq!(err, SessionError::ConnectionTimeout { role: Role::Joiner });
    assert!(err.to_string().contains("host offline"));
    assert_eq!(events.errors(), vec![ErrorKind::ConnectionTimeout]);
}

#[tokio::test(start_paused = true)]
async fn host_without_guests_times_out_after_thirty_seconds() {
    let hub = LoopbackHub::new();
    let (mut h, events) = host(&hub, "901", "Ana");
    h.join().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(31), h.run())
        .await
        .expect("host should give up within 30 s");
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    assert!(err.to_string().contains("no one joined"));
    assert_eq!(events.errors(), vec![ErrorKind::ConnectionTimeout]);
}

#[tokio::test]
async fn retry_after_failure_recovers() {
    let hub = LoopbackHub::new();
    let (mut j, _) = joiner(&hub, "77", "Bob");
    assert!(j.join().await.is_err());

    let (mut h, h_events) = host(&hub, "77", "Ana");
    h.join().await.unwrap();
    let joiner_id = j.reset_and_retry().await.unwrap();
    settle(&mut [&mut h, &mut j]);

    assert_eq!(h_events.joins(), vec![(joiner_id, "Bob".to_owned())]);
    assert_eq!(j.state(), SessionState::Connected);
}

#[tokio::test]
async fn mesh_of_four_converges() {
    let hub = LoopbackHub::new();
    let (mut h, _) = host(&hub, "4", "H");
    let (mut a, _) = joiner(&hub, "4", "A");
    let (mut b, _) = joiner(&hub, "4", "B");
    let (mut c, _) = joiner(&hub, "4", "C");

    h.join().await.unwrap();
    a.join().await.unwrap();
    b.join().await.unwrap();
    c.join().await.unwrap();
    settle(&mut [&mut h, &mut a, &mut b, &mut c]);

    let expected = member_ids(&h);
    assert_eq!(expected.len(), 4);
    assert_eq!(member_ids(&a), expected);
    assert_eq!(member_ids(&b), expected);
    assert_eq!(member_ids(&c), expected);
}
