use std::time::Duration;

use rust_rabbit_worker::rabbitmq::{callback_fn, ConsumerConfig};

use crate::support::{self, FakeBroker, Op};

fn consumer() -> ConsumerConfig {
    ConsumerConfig::new("study", 1, callback_fn(|_, _| Ok(true)))
}

#[tokio::test(start_paused = true)]
async fn test_no_keep_alive_before_start_then_one_per_interval() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    // Interval is 50s in the fixture.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(broker.count(&Op::KeepAlive), 0);

    connection.start_heartbeat();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(broker.count(&Op::KeepAlive), 1);
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(broker.count(&Op::KeepAlive), 2);

    connection.stop_heartbeat();
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(broker.count(&Op::KeepAlive), 2);
    assert_eq!(broker.connects(), 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_failure_reconnects() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();
    connection.start_heartbeat();
    broker.fail_next_keep_alives(1);

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    tokio::time::sleep(Duration::from_secs(51)).await;
    assert_eq!(broker.count(&Op::KeepAlive), 1);
    support::wait_until("reconnect", || broker.connects() == 2).await;
    support::wait_ready(&connection).await;
    assert_eq!(connection.reconnects(), 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_depth_is_sampled_passively() {
    let broker = FakeBroker::new();
    let mut settings = support::load_test_settings();
    settings.queue_depth_interval_ms = Some(10_000);
    let connection = support::connection(&broker, settings);
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(broker.count(&Op::DeclarePassive("study".into())), 2);
    assert_eq!(broker.count(&Op::KeepAlive), 0);

    support::stop(&connection, run).await;
}
