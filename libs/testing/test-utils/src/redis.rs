//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
pub struct TestRedis {
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    host: String,
    port: u16,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container and connect to it
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");
        let host = "127.0.0.1".to_string();

        let client = Client::open(format!("redis://{}:{}", host, port))
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            host,
            port,
        }
    }

    /// A cloned connection for seeding and inspecting keys
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the container while keeping the handle, to simulate an outage
    pub async fn pause(&self) {
        self.container
            .pause()
            .await
            .expect("Failed to pause Redis container");
    }

    /// Resume a container stopped by [`pause`](Self::pause)
    pub async fn unpause(&self) {
        self.container
            .unpause()
            .await
            .expect("Failed to unpause Redis container");
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
