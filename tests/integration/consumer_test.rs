use std::sync::{Arc, Mutex};

use rust_rabbit_worker::message::parse_task;
use rust_rabbit_worker::rabbitmq::{callback_fn, ConsumerConfig, PublisherConfig};

use crate::support::{self, FakeBroker, Op};

/// Records every body it sees and reacts to a few magic payloads.
fn recording_callback(seen: Arc<Mutex<Vec<String>>>) -> ConsumerConfig {
    ConsumerConfig::new(
        "study",
        2,
        callback_fn(move |_, delivery| {
            seen.lock().unwrap().push(delivery.body.clone());
            match delivery.body.as_str() {
                "fail" => Ok(false),
                "error" => Err(anyhow::anyhow!("downstream unavailable")),
                "panic" => panic!("callback blew up"),
                _ => Ok(true),
            }
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn test_only_successful_callbacks_are_acked() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let seen = Arc::new(Mutex::new(Vec::new()));
    connection.register_consumer(recording_callback(seen.clone())).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.deliver(1, b"ok");
    broker.deliver(2, b"fail");
    broker.deliver(3, b"error");
    broker.deliver(4, b"panic");
    broker.deliver(5, b"ok again");
    support::wait_until("all deliveries", || seen.lock().unwrap().len() == 5).await;
    support::wait_until("last ack", || broker.count(&Op::Ack(5)) == 1).await;

    assert_eq!(broker.count(&Op::Ack(1)), 1);
    for tag in 2..=4 {
        assert_eq!(broker.count(&Op::Ack(tag)), 0, "delivery {} must stay unacked", tag);
    }
    assert_eq!(broker.count_matching(|op| matches!(op, Op::Reject(..))), 0);
    assert_eq!(broker.connects(), 1, "a failing callback must not disturb the connection");

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_non_utf8_body_is_rejected_without_requeue() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    let seen = Arc::new(Mutex::new(Vec::new()));
    connection.register_consumer(recording_callback(seen.clone())).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.deliver(9, &[0xc3, 0x28]);
    support::wait_until("reject", || broker.count(&Op::Reject(9, false)) == 1).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(broker.count(&Op::Ack(9)), 0);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_qos_precedes_consume() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection
        .register_consumer(recording_callback(Arc::new(Mutex::new(Vec::new()))))
        .unwrap();

    let run = support::spawn_run(&connection);
    support::wait_until("consume", || broker.count(&Op::Consume("study".into())) == 1).await;

    let ops = broker.ops();
    let qos = ops.iter().position(|op| *op == Op::Qos(2)).unwrap();
    let consume = ops.iter().position(|op| *op == Op::Consume("study".into())).unwrap();
    assert!(qos < consume);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_closes_channel_then_connection() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection
        .register_consumer(recording_callback(Arc::new(Mutex::new(Vec::new()))))
        .unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.cancel_consumer();
    support::wait_until("reconnect", || broker.connects() == 2).await;
    support::wait_until("consume again", || broker.count(&Op::Consume("study".into())) == 2).await;

    let ops = broker.ops();
    let close_channel = ops.iter().position(|op| *op == Op::CloseChannel).unwrap();
    assert_eq!(ops[close_channel + 1], Op::CloseConnection);
    assert_eq!(ops[close_channel + 2], Op::Connect);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_callback_publishes_results_on_the_same_connection() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection
        .register_consumer(ConsumerConfig::new(
            "study",
            1,
            callback_fn(|channel, delivery| {
                let task = match parse_task(&delivery.body) {
                    Ok(task) => task,
                    Err(_) => return Ok(true),
                };
                channel.publish(&serde_json::Value::Object(task))?;
                Ok(true)
            }),
        ))
        .unwrap();
    connection
        .register_publisher(PublisherConfig::new("message", "example.result", "worker"))
        .unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.deliver(1, b"{\"url\": \"http://example.com\"}");
    broker.deliver(2, b"[]");
    support::wait_until("publish", || broker.count(&Op::Publish(1)) == 1).await;
    support::wait_until("acks", || broker.count(&Op::Ack(2)) == 1).await;

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "example.result");
    assert_eq!(published[0].properties.app_id.as_deref(), Some("worker"));
    assert!(published[0].properties.is_persistent());

    let ops = broker.ops();
    let confirm = ops.iter().position(|op| *op == Op::ConfirmSelect).unwrap();
    let consume = ops.iter().position(|op| matches!(op, Op::Consume(_))).unwrap();
    assert!(confirm < consume);

    support::stop(&connection, run).await;
}
