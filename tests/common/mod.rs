//! Common test utilities and scenarios

#![allow(dead_code)]

use mqtt_comms::transport::{MockBroker, MockBrokerListener, MockTransport, Transport};
use mqtt_comms::{
    ConnectOptions, MemoryPersistence, Message, MqttCallback, MqttClient, MqttError,
    MqttPersistence, Token,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

/// Default timeout for test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Set `RUST_LOG=mqtt_comms=debug` to see the client's logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generate a unique test client ID
pub fn test_client_id(test_name: &str) -> String {
    format!("test-{}-{}", test_name, Ulid::new())
}

/// A client wired to an in-memory broker
pub struct TestHarness {
    pub client: MqttClient,
    pub listener: MockBrokerListener,
    pub transport: Arc<MockTransport>,
    pub persistence: Arc<MemoryPersistence>,
    pub events: Arc<RecordingCallback>,
}

impl TestHarness {
    pub fn new(name: &str) -> Self {
        Self::with_persistence(&test_client_id(name), Arc::new(MemoryPersistence::new()))
    }

    /// A client for `client_id` over an existing store
    pub fn with_persistence(client_id: &str, persistence: Arc<MemoryPersistence>) -> Self {
        init_tracing();
        let (transport, listener) = MockTransport::new();
        let transport = Arc::new(transport);
        let client = MqttClient::new(
            client_id,
            transport.clone() as Arc<dyn Transport>,
            persistence.clone() as Arc<dyn MqttPersistence>,
        )
        .expect("client creation failed");
        let events = Arc::new(RecordingCallback::default());
        client.set_callback(events.clone());
        Self {
            client,
            listener,
            transport,
            persistence,
            events,
        }
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new(self.client.client_id())
    }

    /// Connects with `options`, answering the CONNACK from the broker side
    pub async fn connect_with(
        &mut self,
        options: ConnectOptions,
        session_present: bool,
    ) -> (MockBroker, Token) {
        let token = self.client.connect(options).expect("connect refused");
        let broker = self.accept(session_present).await;
        token
            .wait_for(DEFAULT_TIMEOUT)
            .await
            .expect("connect did not complete");
        (broker, token)
    }

    pub async fn connect(&mut self) -> MockBroker {
        let options = self.options();
        self.connect_with(options, false).await.0
    }

    /// Accepts the next connection and answers its CONNECT
    pub async fn accept(&mut self, session_present: bool) -> MockBroker {
        let mut broker = self
            .listener
            .accept_within(DEFAULT_TIMEOUT)
            .await
            .expect("client did not connect");
        broker
            .accept_connect(session_present)
            .await
            .expect("no CONNECT received");
        broker
    }
}

/// Callback recording everything the client reports
#[derive(Default)]
pub struct RecordingCallback {
    messages: Mutex<Vec<Message>>,
    lost: Mutex<Vec<MqttError>>,
    delivered: Mutex<Vec<String>>,
    connects: Mutex<Vec<bool>>,
}

impl MqttCallback for RecordingCallback {
    fn connection_lost(&self, cause: &MqttError) {
        self.lost.lock().unwrap().push(cause.clone());
    }

    fn message_arrived(&self, message: &Message) {
        self.messages.lock().unwrap().push(message.clone());
    }

    fn delivery_complete(&self, token: &Token) {
        self.delivered.lock().unwrap().push(token.key().to_string());
    }

    fn connect_complete(&self, reconnect: bool, _server_uri: &str) {
        self.connects.lock().unwrap().push(reconnect);
    }
}

impl RecordingCallback {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<MqttError> {
        self.lost.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<bool> {
        self.connects.lock().unwrap().clone()
    }

    /// Wait for a specific number of messages
    pub async fn wait_for_messages(&self, count: usize) -> bool {
        wait_until(|| self.messages.lock().unwrap().len() >= count).await
    }

    pub async fn wait_for_loss(&self) -> bool {
        wait_until(|| !self.lost.lock().unwrap().is_empty()).await
    }

    pub async fn wait_for_connects(&self, count: usize) -> bool {
        wait_until(|| self.connects.lock().unwrap().len() >= count).await
    }
}

/// Polls `condition` until it holds or `DEFAULT_TIMEOUT` passes
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < DEFAULT_TIMEOUT {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
