//! Error handling and edge case tests.

use realtime_relay::{
    BusConfig, DuplicatePollPolicy, EventBus, EventId, EventPublisher, EventSequence, EventType,
    InMemoryBus, InterestTarget, OwnerId, PollRequest, PublishRequest, QueueId, QueueManager,
    RelayConfig, RelayError, TopicId,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn test_manager() -> QueueManager {
    QueueManager::new(RelayConfig::default(), Arc::new(EventSequence::new())).unwrap()
}

// --- Queue Errors ---

#[test]
fn test_poll_unknown_queue() {
    let manager = test_manager();
    let missing = QueueId::generate();

    let err = manager
        .poll(PollRequest::new(missing, EventId(0)))
        .unwrap_err();
    assert!(matches!(err, RelayError::QueueExpired(id) if id == missing));
    assert!(err.requires_registration());
}

#[test]
fn test_heartbeat_and_deregister_unknown_queue() {
    let manager = test_manager();
    let missing = QueueId::generate();

    assert!(matches!(
        manager.heartbeat(missing),
        Err(RelayError::QueueExpired(_))
    ));
    assert!(matches!(
        manager.deregister(missing),
        Err(RelayError::QueueExpired(_))
    ));
}

#[test]
fn test_update_interests_missing_targets() {
    let manager = test_manager();

    // Unknown owner is not an error
    let result = manager
        .update_interests(InterestTarget::Owner(OwnerId(99)), [TopicId(1)])
        .unwrap();
    assert!(result.is_none());

    let result = manager.update_interests(InterestTarget::Queue(QueueId::generate()), [TopicId(1)]);
    assert!(matches!(result, Err(RelayError::QueueExpired(_))));
}

#[test]
fn test_register_without_topics() {
    let manager = test_manager();
    let err = manager.register(OwnerId(1), Vec::<TopicId>::new()).unwrap_err();
    assert!(matches!(err, RelayError::InvalidRegistration(_)));
    assert!(!err.requires_registration());
    assert_eq!(manager.store().len(), 0);
}

#[test]
fn test_malformed_queue_token() {
    assert!("not-a-uuid".parse::<QueueId>().is_err());
}

// --- Duplicate Polls ---

#[test]
fn test_duplicate_poll_rejected() {
    let config = RelayConfig {
        duplicate_poll: DuplicatePollPolicy::Reject,
        ..Default::default()
    };
    let manager = Arc::new(QueueManager::new(config, Arc::new(EventSequence::new())).unwrap());
    let reg = manager.register(OwnerId(1), [TopicId(1)]).unwrap();

    let (request, cancel) = PollRequest::new(reg.queue_id, EventId(0)).cancellable();
    let first = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.poll(request))
    };
    while manager.health().pending_polls == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }

    let second = manager.poll(PollRequest::new(reg.queue_id, EventId(0)));
    assert!(matches!(second, Err(RelayError::DuplicatePoll(id)) if id == reg.queue_id));

    cancel.cancel();
    assert!(first.join().unwrap().is_ok());
    assert_eq!(manager.health().pending_polls, 0);
}

// --- Bus Failures ---

#[test]
fn test_bus_outage_does_not_affect_relay() {
    let sequence = Arc::new(EventSequence::new());
    let bus = Arc::new(InMemoryBus::new(&BusConfig::default(), Arc::clone(&sequence)));
    let manager = Arc::new(QueueManager::new(RelayConfig::default(), Arc::clone(&sequence)).unwrap());
    let publisher = EventPublisher::new(bus.clone(), Arc::clone(&sequence));

    let _listener = manager.listen(bus.as_ref()).unwrap();
    let reg = manager.register(OwnerId(1), [TopicId(1)]).unwrap();

    bus.close();
    let request = PublishRequest::new(EventType::NewComment, [TopicId(1)]);
    assert!(matches!(
        publisher.publish(request.clone()),
        Err(RelayError::BusUnavailable(_))
    ));
    assert_eq!(publisher.publish_best_effort(request), None);
    assert_eq!(publisher.events_failed(), 2);

    // Client operations keep working
    manager.heartbeat(reg.queue_id).unwrap();
    let response = manager
        .poll(PollRequest::new(reg.queue_id, EventId(0)).with_timeout(Duration::from_millis(20)))
        .unwrap();
    assert!(response.is_empty());

    assert!(matches!(
        manager.listen(bus.as_ref()),
        Err(RelayError::BusUnavailable(_))
    ));
}

#[test]
fn test_garbage_on_bus_is_skipped() {
    let sequence = Arc::new(EventSequence::new());
    let bus = InMemoryBus::new(&BusConfig::default(), Arc::clone(&sequence));
    let manager = Arc::new(QueueManager::new(RelayConfig::default(), Arc::clone(&sequence)).unwrap());
    let _listener = manager.listen(&bus).unwrap();
    let reg = manager.register(OwnerId(1), [TopicId(1)]).unwrap();

    bus.publish_raw(b"{ not json".to_vec()).unwrap();
    // No topics and no recipients
    bus.publish_raw(br#"{"type": "new_comment"}"#.to_vec()).unwrap();
    bus.publish_raw(br#"{"type": "new_comment", "community_ids": [1]}"#.to_vec())
        .unwrap();

    let response = manager
        .poll(PollRequest::new(reg.queue_id, EventId(0)).with_timeout(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(response.event_ids(), vec![EventId(1)]);
    assert_eq!(bus.name(), "memory");
}

// --- Configuration ---

#[test]
fn test_config_file_round_trip() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
buffer_capacity = 25
poll_timeout_secs = 30
queue_ttl_secs = 90

[bus]
channel = "relay_test"
"#
    )
    .unwrap();

    let config = RelayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.buffer_capacity, 25);
    assert_eq!(config.poll_timeout(), Duration::from_secs(30));
    assert_eq!(config.bus.channel, "relay_test");
}

#[test]
fn test_config_file_errors() {
    let missing = RelayConfig::from_file("/nonexistent/relay.toml");
    assert!(matches!(missing, Err(RelayError::Io(_))));

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "buffer_capacity = 0").unwrap();
    let invalid = RelayConfig::from_file(file.path());
    assert!(matches!(invalid, Err(RelayError::InvalidConfig(_))));
}

#[test]
fn test_manager_rejects_invalid_config() {
    let config = RelayConfig {
        queue_ttl_secs: 10,
        poll_timeout_secs: 60,
        ..Default::default()
    };
    let result = QueueManager::new(config, Arc::new(EventSequence::new()));
    assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
}
