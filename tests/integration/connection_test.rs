use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rust_rabbit_worker::rabbitmq::{
    callback_fn, ConnectionRegistry, ConnectionState, ConsumerConfig, HandlerFactory, HandlerSpec,
    RabbitMQError,
};

use crate::support::{self, FakeBroker, Op};

fn consumer() -> ConsumerConfig {
    ConsumerConfig::new("study", 1, callback_fn(|_, _| Ok(true)))
}

#[tokio::test(start_paused = true)]
async fn test_setup_runs_in_protocol_order() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_until("consume", || broker.count(&Op::Consume("study".into())) == 1).await;

    assert_eq!(
        broker.ops(),
        vec![
            Op::Connect,
            Op::OpenChannel,
            Op::DeclareExchange("message".into()),
            Op::DeclareQueue("study".into()),
            Op::Bind("study".into()),
            Op::Qos(1),
            Op::Consume("study".into()),
        ]
    );
    assert_eq!(connection.state(), ConnectionState::ChannelReady);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_every_queue_is_declared_before_any_bind() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection
        .register_consumer(ConsumerConfig::new("text", 4, callback_fn(|_, _| Ok(true))))
        .unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    let ops = broker.ops();
    let last_declare = ops
        .iter()
        .rposition(|op| matches!(op, Op::DeclareQueue(_)))
        .unwrap();
    let first_bind = ops.iter().position(|op| matches!(op, Op::Bind(_))).unwrap();
    assert!(last_declare < first_bind);
    // The consumer queue is not part of the topology, so it is added to it.
    assert_eq!(broker.count(&Op::DeclareQueue("text".into())), 1);
    assert_eq!(broker.count(&Op::Bind("text".into())), 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_once_per_unexpected_close() {
    let broker = FakeBroker::new();
    let settings = support::load_test_settings();
    let delay = settings.retry_delay();
    let connection = support::connection(&broker, settings);
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    for round in 1..=3 {
        let dropped_at = Instant::now();
        broker.drop_connection();
        support::wait_until("reconnect", || broker.connects() == round + 1).await;
        support::wait_ready(&connection).await;

        let reconnected_at = *broker.connect_times().last().unwrap();
        assert!(reconnected_at - dropped_at >= delay);
    }

    tokio::time::sleep(delay * 5).await;
    assert_eq!(broker.connects(), 4);
    assert_eq!(connection.reconnects(), 3);

    // Consumption resumes on the fresh channel.
    broker.deliver(1, b"{\"url\": \"http://example.com\"}");
    support::wait_until("ack", || broker.count(&Op::Ack(1)) == 1).await;

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_drop_mid_consumption_runs_one_setup_sequence() {
    let broker = FakeBroker::new();
    let settings = support::load_test_settings();
    let delay = settings.retry_delay();
    let connection = support::connection(&broker, settings);
    connection
        .register_consumer(ConsumerConfig::new("study", 1, callback_fn(|_, _| Ok(false))))
        .unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.deliver(1, b"{\"url\": \"http://example.com\"}");
    broker.drop_channel_and_connection();

    support::wait_until("reconnect", || broker.connects() == 2).await;
    support::wait_ready(&connection).await;
    tokio::time::sleep(delay * 5).await;

    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.count(&Op::OpenChannel), 2);
    assert_eq!(broker.count(&Op::DeclareExchange("message".into())), 2);
    assert_eq!(broker.count(&Op::Bind("study".into())), 2);
    assert_eq!(broker.count(&Op::Ack(1)), 0);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_closes_once() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    connection.stop();
    connection.stop();
    run.await.unwrap().unwrap();
    connection.stop();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(broker.count(&Op::Cancel), 1);
    assert_eq!(broker.count(&Op::CloseChannel), 1);
    assert_eq!(broker.count(&Op::CloseConnection), 1);

    let ops = broker.ops();
    assert_eq!(
        &ops[ops.len() - 3..],
        &[Op::Cancel, Op::CloseChannel, Op::CloseConnection]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_reconnecting_suppresses_reconnect() {
    let broker = FakeBroker::new();
    let settings = support::load_test_settings();
    let delay = settings.retry_delay();
    let connection = support::connection(&broker, settings);
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.drop_connection();
    support::wait_until("reconnecting", || connection.state() == ConnectionState::Reconnecting).await;
    support::stop(&connection, run).await;

    tokio::time::sleep(delay * 3).await;
    assert_eq!(broker.connects(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_reaches_the_caller() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();
    broker.fail_next_connects(10);

    let started = Instant::now();
    let err = connection.clone().run().await.unwrap_err();

    assert!(matches!(err, RabbitMQError::ConnectionError(_)));
    assert_eq!(broker.connects(), 2);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_retries_until_the_broker_answers() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();
    broker.fail_next_connects(1);

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;
    assert_eq!(broker.connects(), 2);
    assert_eq!(connection.reconnects(), 0);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_initial_retry_sleep_is_not_an_error() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();
    broker.fail_next_connects(10);

    let run = support::spawn_run(&connection);
    support::wait_until("first failure", || connection.state() == ConnectionState::Reconnecting).await;
    connection.stop();

    run.await.unwrap().unwrap();
    assert_eq!(broker.connects(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_closes_connection_and_retries() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();
    broker.fail_next_binds(1);

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    let ops = broker.ops();
    let failed_bind = ops.iter().position(|op| *op == Op::Bind("study".into())).unwrap();
    assert_eq!(ops[failed_bind + 1], Op::CloseConnection);
    assert_eq!(ops[failed_bind + 2], Op::Connect);
    assert_eq!(broker.count(&Op::Consume("study".into())), 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_close_escalates_to_reconnect() {
    let broker = FakeBroker::new();
    let connection = support::connection(&broker, support::load_test_settings());
    connection.register_consumer(consumer()).unwrap();

    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    broker.close_channel("PRECONDITION_FAILED - inequivalent arg 'durable'");
    support::wait_until("reconnect", || broker.connects() == 2).await;
    support::wait_ready(&connection).await;
    assert_eq!(broker.count(&Op::CloseConnection), 1);

    support::stop(&connection, run).await;
}

#[tokio::test(start_paused = true)]
async fn test_registry_hands_out_one_connection() {
    let broker = FakeBroker::new();
    let registry = ConnectionRegistry::with_connector(Arc::new(broker.clone()));

    let connection = registry
        .get_or_init(support::load_test_settings(), support::topology())
        .unwrap();
    let again = registry
        .get_or_init(rust_rabbit_worker::ConnectionSettings::new("x", "y"), support::topology())
        .unwrap();
    assert!(Arc::ptr_eq(&connection, &again));

    HandlerFactory::create(&connection, HandlerSpec::Consumer(consumer())).unwrap();
    let run = support::spawn_run(&connection);
    support::wait_ready(&connection).await;

    // Handlers cannot be added to a running connection.
    assert!(HandlerFactory::create(&connection, HandlerSpec::Consumer(consumer())).is_err());

    registry.teardown();
    run.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(broker.connects(), 1);
}
