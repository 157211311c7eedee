// Integration tests run against an in-memory broker, no RabbitMQ instance needed.


mod connection_test;
mod consumer_test;
mod heartbeat_test;
mod publisher_test;
