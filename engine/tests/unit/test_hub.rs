//! Log broadcast hub tests

use std::time::Duration;

use futures::StreamExt;
use tokio_test::assert_ok;

use deploy_engine::errors::EngineError;
use deploy_engine::hub::{LogHub, Subscription};
use deploy_engine::models::deployment::{DeploymentId, DeploymentState, StageName};
use deploy_engine::models::log_event::{LogEvent, LogRecord, LogSource};

fn line(text: &str) -> LogRecord {
    LogRecord::output(LogSource::Stdout, text)
}

async fn drain(mut sub: Subscription) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.next().await.unwrap() {
        events.push(event);
    }
    events
}

fn assert_gapless(events: &[LogEvent], from: u64) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, from + i as u64, "gap at index {}", i);
    }
}

#[tokio::test]
async fn test_sequences_start_at_zero_and_increase() {
    let hub = LogHub::default();
    let id = DeploymentId::from("seq");
    hub.open(&id);

    for i in 0..5 {
        let event = assert_ok!(hub.publish(&id, line(&format!("line {}", i))));
        assert_eq!(event.sequence, i);
        assert_eq!(event.deployment_id, id);
    }
    assert_eq!(hub.next_sequence(&id), Some(5));
}

#[tokio::test]
async fn test_late_subscriber_replays_then_goes_live() {
    let hub = LogHub::default();
    let id = DeploymentId::from("late");
    hub.open(&id);

    hub.publish(&id, LogRecord::stage_started(StageName::Provision)).unwrap();
    hub.publish(&id, line("one")).unwrap();

    let sub = hub.subscribe(&id, 0).unwrap();
    hub.publish(&id, line("two")).unwrap();
    hub.publish(&id, LogRecord::deployment_finished(DeploymentState::Succeeded, None))
        .unwrap();
    hub.close(&id);

    let events = drain(sub).await;
    assert_eq!(events.len(), 4);
    assert_gapless(&events, 0);
    assert_eq!(events[2].text, "two");
    assert!(events[3].is_terminal());
}

#[tokio::test]
async fn test_resume_from_cursor_without_duplicates() {
    let hub = LogHub::default();
    let id = DeploymentId::from("resume");
    hub.open(&id);

    for i in 0..10 {
        hub.publish(&id, line(&i.to_string())).unwrap();
    }

    // Client saw 0..=6 and reconnects with last seen + 1
    let sub = hub.subscribe(&id, 7).unwrap();
    hub.publish(&id, line("10")).unwrap();
    hub.close(&id);

    let events = drain(sub).await;
    let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["7", "8", "9", "10"]);
    assert_gapless(&events, 7);
}

#[tokio::test]
async fn test_cursor_ahead_of_buffer_skips_to_cursor() {
    let hub = LogHub::default();
    let id = DeploymentId::from("ahead");
    hub.open(&id);
    hub.publish(&id, line("0")).unwrap();

    let sub = hub.subscribe(&id, 3).unwrap();
    for i in 1..5 {
        hub.publish(&id, line(&i.to_string())).unwrap();
    }
    hub.close(&id);

    let events = drain(sub).await;
    assert_eq!(events.len(), 2);
    assert_gapless(&events, 3);
}

#[tokio::test]
async fn test_every_subscriber_sees_the_same_order() {
    let hub = LogHub::default();
    let id = DeploymentId::from("fanout");
    hub.open(&id);

    let subs: Vec<Subscription> = (0..3).map(|_| hub.subscribe(&id, 0).unwrap()).collect();
    assert_eq!(hub.subscriber_count(&id), 3);

    let publisher = {
        let hub = hub.clone();
        let id = id.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                hub.publish(&id, line(&i.to_string())).unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            hub.close(&id);
        })
    };

    let results = futures::future::join_all(subs.into_iter().map(drain)).await;
    publisher.await.unwrap();

    for events in results {
        assert_eq!(events.len(), 200);
        assert_gapless(&events, 0);
    }
}

#[tokio::test]
async fn test_slow_subscriber_is_disconnected_not_blocking() {
    let hub = LogHub::new(4);
    let id = DeploymentId::from("slow");
    hub.open(&id);

    let mut slow = hub.subscribe(&id, 0).unwrap();

    // Publishing never waits on the subscriber
    let publish = async {
        for i in 0..20 {
            hub.publish(&id, line(&i.to_string())).unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(1), publish)
        .await
        .expect("publisher blocked by slow subscriber");
    assert_eq!(hub.subscriber_count(&id), 0);

    let mut received = Vec::new();
    let lagged_at = loop {
        match slow.next().await {
            Ok(Some(event)) => received.push(event),
            Ok(None) => panic!("lagging subscriber ended without an error"),
            Err(EngineError::SubscriberLagged { next_sequence }) => break next_sequence,
            Err(e) => panic!("unexpected error: {}", e),
        }
    };
    assert_eq!(received.len(), 4);
    assert_gapless(&received, 0);
    assert_eq!(lagged_at, 4);

    // Resubscribing at the reported cursor resumes without loss
    hub.close(&id);
    let resumed = drain(hub.subscribe(&id, lagged_at).unwrap()).await;
    assert_eq!(resumed.len(), 16);
    assert_gapless(&resumed, 4);
}

#[tokio::test]
async fn test_buffer_evicted_after_last_subscriber_leaves() {
    let hub = LogHub::default();
    let id = DeploymentId::from("evict");
    hub.open(&id);

    let sub = hub.subscribe(&id, 0).unwrap();
    hub.publish(&id, line("x")).unwrap();
    hub.close(&id);
    assert!(hub.contains(&id));

    let stream = sub.into_stream();
    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.len(), 1);
    assert!(!hub.contains(&id));
}

#[tokio::test]
async fn test_subscription_from_persisted_transcript() {
    let hub = LogHub::default();
    let id = DeploymentId::from("persisted");
    hub.open(&id);
    for i in 0..3 {
        hub.publish(&id, line(&i.to_string())).unwrap();
    }
    let transcript = hub.events_since(&id, 0);
    hub.close(&id);
    assert!(!hub.contains(&id));

    let events = drain(Subscription::from_transcript(transcript, 1)).await;
    assert_eq!(events.len(), 2);
    assert_gapless(&events, 1);
}

#[tokio::test]
async fn test_unknown_deployment() {
    let hub = LogHub::default();
    let id = DeploymentId::from("missing");
    assert!(matches!(hub.subscribe(&id, 0), Err(EngineError::NotFound(_))));
    assert!(matches!(hub.publish(&id, line("x")), Err(EngineError::NotFound(_))));
}
