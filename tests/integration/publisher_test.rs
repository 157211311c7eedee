use serde_json::json;

use rust_rabbit_worker::rabbitmq::{
    ConfirmOutcome, ConnectionState, PublishStats, PublisherConfig, RabbitMQError,
};

use crate::support::{self, FakeBroker, Op};

fn publisher_config() -> PublisherConfig {
    PublisherConfig::new("message", "example.text", "tests")
}

#[tokio::test(start_paused = true)]
async fn test_acks_and_nacks_empty_the_outstanding_set() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let publisher = connection.register_publisher(publisher_config()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;
    assert_eq!(broker.count(&Op::ConfirmSelect), 1);

    for id in 1..=3 {
        publisher.publish(&json!({ "id": id })).unwrap();
    }
    support::wait_until("three publishes", || connection.publish_stats().outstanding == 3).await;

    broker.confirm(1, false, ConfirmOutcome::Ack);
    broker.confirm(3, false, ConfirmOutcome::Ack);
    broker.confirm(2, false, ConfirmOutcome::Nack);
    support::wait_until("confirmations", || connection.publish_stats().outstanding == 0).await;

    assert_eq!(
        connection.publish_stats(),
        PublishStats {
            published: 3,
            acked: 2,
            nacked: 1,
            outstanding: 0,
            dropped: 0,
            abandoned: 0,
            backpressure_warnings: 0,
        }
    );
    assert_eq!(
        broker.count_matching(|op| matches!(op, Op::Publish(_))),
        3
    );

    // A duplicate confirmation removes nothing.
    broker.confirm(1, false, ConfirmOutcome::Ack);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(connection.publish_stats().acked, 2);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_multiple_confirmation_settles_a_prefix() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let publisher = connection.register_publisher(publisher_config()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    for id in 1..=4 {
        publisher.publish(&json!({ "id": id })).unwrap();
    }
    support::wait_until("publishes", || connection.publish_stats().outstanding == 4).await;

    broker.confirm(3, true, ConfirmOutcome::Ack);
    support::wait_until("ranged ack", || connection.publish_stats().acked == 3).await;
    assert_eq!(connection.publish_stats().outstanding, 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_while_reconnecting_is_dropped() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let publisher = connection.register_publisher(publisher_config()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    publisher.publish(&json!({ "id": 1 })).unwrap();
    publisher.publish(&json!({ "id": 2 })).unwrap();
    support::wait_until("publishes", || connection.publish_stats().outstanding == 2).await;

    broker.drop_connection();
    support::wait_until("reconnecting", || connection.state() == ConnectionState::Reconnecting).await;

    publisher.publish(&json!({ "id": 3 })).unwrap();
    support::wait_until("drop", || connection.publish_stats().dropped == 1).await;
    assert_eq!(broker.count_matching(|op| matches!(op, Op::Publish(_))), 2);
    assert_eq!(connection.publish_stats().abandoned, 2);

    // After the reconnect numbering starts over on the new channel.
    support::wait_ready(&connection).await;
    publisher.publish(&json!({ "id": 4 })).unwrap();
    support::wait_until("republish", || broker.count(&Op::Publish(1)) == 2).await;
    assert_eq!(broker.count(&Op::ConfirmSelect), 2);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_during_initial_connect_retry_is_dropped() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let publisher = connection.register_publisher(publisher_config()).unwrap();
    broker.fail_next_connects(1);

    let run = support::spawn_run(&connection);
    support::wait_until("retry", || connection.state() == ConnectionState::Reconnecting).await;

    publisher.publish(&json!({ "id": 1 })).unwrap();
    assert_eq!(connection.publish_stats().dropped, 1);

    support::wait_ready(&connection).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.count_matching(|op| matches!(op, Op::Publish(_))), 0);
    assert_eq!(connection.publish_stats().published, 0);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_outstanding_confirms_over_threshold_are_flagged() {
    let broker = FakeBroker::new();
    let mut settings = support::load_test_settings();
    settings.backpressure_threshold = Some(1);
    let connection = support::connection(&broker, settings);
    let publisher = connection.register_publisher(publisher_config()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    publisher.publish(&json!({ "id": 1 })).unwrap();
    support::wait_until("first publish", || connection.publish_stats().outstanding == 1).await;
    assert_eq!(connection.publish_stats().backpressure_warnings, 0);

    publisher.publish(&json!({ "id": 2 })).unwrap();
    support::wait_until("second publish", || connection.publish_stats().outstanding == 2).await;
    assert_eq!(connection.publish_stats().backpressure_warnings, 1);

    broker.confirm(2, true, ConfirmOutcome::Ack);
    support::wait_until("confirmations", || connection.publish_stats().outstanding == 0).await;
    publisher.publish(&json!({ "id": 3 })).unwrap();
    support::wait_until("third publish", || connection.publish_stats().outstanding == 1).await;
    assert_eq!(connection.publish_stats().backpressure_warnings, 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_shutdown_reports_the_drop() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let publisher = connection.register_publisher(publisher_config()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;
    support::stop(&connection, run).await;

    assert!(matches!(
        publisher.publish(&json!({ "id": 1 })),
        Err(RabbitMQError::PublishDropped(_))
    ));
    assert_eq!(broker.count_matching(|op| matches!(op, Op::Publish(_))), 0);
}
