//! Connection state machine and packet dispatch - NO EVENT LOOPS
//!
//! `ClientComms` owns everything one client shares between the caller side
//! and its background tasks. Caller operations enqueue packets and return a
//! token straight away; the reader task hands every decoded packet to
//! [`ClientComms::handle_packet`], which resolves tokens and drives the QoS
//! handshakes.
//!
//! Each successful connect gets a new generation number. Tasks carry the
//! generation they were started for, so a late report from a dead
//! connection is ignored and a loss is handled once.

use crate::callback::{MessageListener, MqttCallback, SubscriptionListeners};
use crate::client::connection::ConnectionState;
use crate::client::error_recovery::is_recoverable;
use crate::codec::PacketCodec;
use crate::error::{MqttError, Result};
use crate::network::{NetworkReader, NetworkWriter, Outbound, OutboundQueue};
use crate::packet::{
    ConnAckPacket, ConnectPacket, DisconnectPacket, Packet, PubAckPacket, PubCompPacket,
    PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket, SubscribePacket, TopicFilter,
    UnsubAckPacket, UnsubscribePacket,
};
use crate::persistence::MqttPersistence;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::session::{ClientState, InflightRecord, InflightStore};
use crate::tasks;
use crate::token::{
    key_for_id, Token, TokenKind, TokenStore, CONNECT_KEY, DISCONNECT_KEY, PING_KEY,
};
use crate::topic_matching::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;
use crate::types::{ConnectOptions, Message};
use crate::{ProtocolVersion, QoS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Records are persisted in the v5 encoding whatever the connection speaks;
/// it is a superset of 3.1.1 for PUBLISH and PUBREL.
const PERSISTENCE_VERSION: ProtocolVersion = ProtocolVersion::V5;

pub(crate) struct ClientComms {
    state: Arc<ClientState>,
    tokens: TokenStore,
    inflight: InflightStore,
    transport: Arc<dyn Transport>,
    callback: RwLock<Option<Arc<dyn MqttCallback>>>,
    listeners: SubscriptionListeners,
    inner: Mutex<CommsInner>,
}

struct CommsInner {
    connection_state: ConnectionState,
    generation: u64,
    active: Option<ActiveConnection>,
    options: Option<ConnectOptions>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ActiveConnection {
    generation: u64,
    queue: Arc<OutboundQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveConnection {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Outcome of starting a disconnect
#[derive(Debug)]
pub(crate) enum DisconnectStart {
    /// Connection `generation` is quiescing; finish with
    /// [`ClientComms::run_disconnect`]
    Quiescing { generation: u64, token: Token },
    /// A pending automatic reconnect was stopped. The token is complete.
    Cancelled(Token),
}

/// How a connection came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Network failure or protocol violation
    Lost,
    /// Application asked for it
    Disconnected,
}

impl ClientComms {
    /// Opens `persistence` for `client_id` and restores delivery tokens for
    /// publishes a previous instance left unacknowledged
    pub(crate) fn new(
        client_id: &str,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn MqttPersistence>,
    ) -> Result<Self> {
        persistence.open(client_id)?;
        let comms = Self {
            state: Arc::new(ClientState::new(client_id)),
            tokens: TokenStore::new(),
            inflight: InflightStore::new(persistence, PERSISTENCE_VERSION),
            transport,
            callback: RwLock::new(None),
            listeners: SubscriptionListeners::new(),
            inner: Mutex::new(CommsInner {
                connection_state: ConnectionState::Disconnected,
                generation: 0,
                active: None,
                options: None,
                reconnect_task: None,
            }),
        };
        comms.restore_delivery_tokens()?;
        Ok(comms)
    }

    fn lock(&self) -> MutexGuard<'_, CommsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    pub(crate) fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub(crate) fn server_uri(&self) -> String {
        self.transport.server_uri()
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.lock().connection_state
    }

    pub(crate) fn set_callback(&self, callback: Arc<dyn MqttCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn callback(&self) -> Option<Arc<dyn MqttCallback>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivery tokens for every persisted outbound record, with their
    /// packet ids reserved
    fn restore_delivery_tokens(&self) -> Result<usize> {
        let mut restored = 0;
        for record in self.inflight.restore()? {
            match record {
                InflightRecord::AwaitingAck(publish) => {
                    self.state.reserve_packet_id(record_id(&publish));
                    self.tokens.restore(&publish)?;
                }
                InflightRecord::AwaitingPubComp { pubrel, publish } => {
                    self.state.reserve_packet_id(pubrel.packet_id);
                    self.restore_pubcomp_token(pubrel.packet_id, publish.as_ref())?;
                }
                InflightRecord::AwaitingRelease(_) => continue,
            }
            restored += 1;
        }
        if restored > 0 {
            debug!(count = restored, "Restored delivery tokens from persistence");
        }
        Ok(restored)
    }

    fn restore_pubcomp_token(&self, id: u16, publish: Option<&PublishPacket>) -> Result<Token> {
        if let Some(publish) = publish {
            return self.tokens.restore(publish);
        }
        if let Some(existing) = self.tokens.get(&key_for_id(id)) {
            return Ok(existing);
        }
        let token = Token::new(key_for_id(id), TokenKind::Delivery);
        self.tokens.save(&token)?;
        Ok(token)
    }

    // ---------------------------------------------------------------------
    // Connect
    // ---------------------------------------------------------------------

    /// Moves to `Connecting` and registers the connect token
    pub(crate) fn begin_connect(&self, options: &ConnectOptions) -> Result<Token> {
        {
            let mut inner = self.lock();
            match inner.connection_state {
                ConnectionState::Disconnected => {}
                ConnectionState::Connected => return Err(MqttError::AlreadyConnected),
                ConnectionState::Closed => return Err(MqttError::ConnectionClosed),
                other => {
                    return Err(MqttError::InvalidState(format!(
                        "cannot connect while {other:?}"
                    )))
                }
            }
            inner.connection_state = ConnectionState::Connecting;
            inner.options = Some(options.clone());
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
        }
        self.register_connect_token()
    }

    /// Moves to `Connecting` for an automatic or manual reconnect with the
    /// last options
    pub(crate) fn begin_reconnect(&self) -> Result<(ConnectOptions, Token)> {
        let options = {
            let mut inner = self.lock();
            match inner.connection_state {
                ConnectionState::Disconnected => {}
                ConnectionState::Closed => return Err(MqttError::ConnectionClosed),
                ConnectionState::Connected => return Err(MqttError::AlreadyConnected),
                other => {
                    return Err(MqttError::InvalidState(format!(
                        "cannot reconnect while {other:?}"
                    )))
                }
            }
            let options = inner
                .options
                .clone()
                .ok_or_else(|| MqttError::InvalidState("never connected".to_string()))?;
            inner.connection_state = ConnectionState::Connecting;
            options
        };
        let token = self.register_connect_token()?;
        Ok((options, token))
    }

    fn register_connect_token(&self) -> Result<Token> {
        let token = Token::new(CONNECT_KEY, TokenKind::Connect);
        self.tokens.open();
        if let Err(e) = self.tokens.save(&token) {
            self.set_state_unless_closed(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(token)
    }

    fn set_state_unless_closed(&self, state: ConnectionState) {
        let mut inner = self.lock();
        if inner.connection_state != ConnectionState::Closed {
            inner.connection_state = state;
        }
    }

    /// Runs one connection attempt to completion and settles `token`
    ///
    /// The whole attempt, transport connect included, is bounded by the
    /// connection timeout.
    pub(crate) async fn run_connect(
        self: Arc<Self>,
        options: ConnectOptions,
        token: Token,
        reconnect: bool,
    ) -> Result<()> {
        let attempt = timeout(options.connection_timeout, self.establish(&options))
            .await
            .map_err(|_| MqttError::Timeout)
            .and_then(|result| result);

        let activated = attempt.and_then(|(reader, writer, connack)| {
            self.activate(reader, writer, connack, &options, &token, reconnect)
        });

        match activated {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, reconnect, "Connection attempt failed");
                if self.release_connect_token(&token) {
                    self.set_state_unless_closed(ConnectionState::Disconnected);
                }
                token.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Removes the connect token if it is still `token`. False once a
    /// disconnect or close has taken the attempt over.
    fn release_connect_token(&self, token: &Token) -> bool {
        match self.tokens.get(CONNECT_KEY) {
            Some(stored) if stored.same_as(token) => {
                self.tokens.remove(CONNECT_KEY);
                true
            }
            _ => false,
        }
    }

    /// Stops the automatic reconnect task
    ///
    /// Returns `None` if no reconnect was pending. Otherwise the client is
    /// back to `Disconnected` and the result holds the connect token of an
    /// attempt that was cut off, for the caller to fail once `inner` is
    /// unlocked.
    fn cancel_reconnect(&self, inner: &mut CommsInner) -> Option<Vec<Token>> {
        let task = inner.reconnect_task.take()?;
        task.abort();
        match inner.connection_state {
            ConnectionState::Disconnected => Some(Vec::new()),
            ConnectionState::Connecting => {
                inner.connection_state = ConnectionState::Disconnected;
                Some(self.tokens.remove(CONNECT_KEY).into_iter().collect())
            }
            _ => None,
        }
    }

    async fn establish(
        &self,
        options: &ConnectOptions,
    ) -> Result<(NetworkReader, NetworkWriter, ConnAckPacket)> {
        self.state.configure(options);
        if options.clean_start {
            self.discard_session()?;
        }

        let (read_half, write_half) = self.transport.connect().await?;
        let version = options.protocol_version;
        let limits = self.state.limits();
        let mut reader = NetworkReader::new(
            read_half,
            PacketCodec::new(version).with_max_incoming(limits.max_incoming),
            options.read_timeout,
            self.state.clone(),
        );
        let mut writer = NetworkWriter::new(
            write_half,
            PacketCodec::new(version),
            options.write_chunk_size,
            self.state.clone(),
        );

        let connect = ConnectPacket::from_options(options);
        writer.write_packet(&Packet::Connect(Box::new(connect))).await?;

        loop {
            match reader.read_packet().await? {
                None => continue,
                Some(Packet::ConnAck(connack)) => {
                    if connack.reason_code.is_error() {
                        return Err(MqttError::ConnectionRefused(connack.reason_code));
                    }
                    return Ok((reader, writer, connack));
                }
                Some(other) => {
                    return Err(MqttError::ProtocolError(format!(
                        "expected CONNACK, received {:?}",
                        other.packet_type()
                    )))
                }
            }
        }
    }

    /// Drops all session state for a clean start
    fn discard_session(&self) -> Result<()> {
        let discarded = self.tokens.drain_where(Token::is_delivery);
        self.inflight.clear()?;
        self.state.clear_packet_ids();
        for token in discarded {
            token.fail(MqttError::InvalidState(
                "session discarded by clean start".to_string(),
            ));
        }
        Ok(())
    }

    fn activate(
        self: &Arc<Self>,
        reader: NetworkReader,
        writer: NetworkWriter,
        connack: ConnAckPacket,
        options: &ConnectOptions,
        token: &Token,
        reconnect: bool,
    ) -> Result<()> {
        self.state.apply_connack(&connack);
        let queue = Arc::new(OutboundQueue::new());
        if !options.clean_start {
            self.resume_inflight(&queue)?;
        }

        {
            let mut inner = self.lock();
            if inner.connection_state != ConnectionState::Connecting {
                return Err(MqttError::ConnectionClosed);
            }
            inner.generation += 1;
            let generation = inner.generation;
            inner.connection_state = ConnectionState::Connected;
            let tasks = vec![
                tokio::spawn(tasks::reader_task(reader, self.clone(), generation)),
                tokio::spawn(tasks::writer_task(
                    writer,
                    queue.clone(),
                    self.clone(),
                    generation,
                )),
                tokio::spawn(tasks::keepalive_task(self.clone(), generation)),
            ];
            inner.active = Some(ActiveConnection {
                generation,
                queue,
                tasks,
            });
        }

        let session_present = connack.session_present;
        self.tokens.remove(CONNECT_KEY);
        token.complete(Some(Packet::ConnAck(connack)));
        info!(
            client_id = %self.state.client_id(),
            session_present,
            reconnect,
            "Connected"
        );
        if let Some(callback) = self.callback() {
            callback.connect_complete(reconnect, &self.server_uri());
        }
        Ok(())
    }

    /// Queues the resend of every unfinished outbound handshake, ahead of
    /// anything the application sends on the new connection
    fn resume_inflight(&self, queue: &OutboundQueue) -> Result<()> {
        let mut resent = 0usize;
        for record in self.inflight.restore()? {
            match record {
                InflightRecord::AwaitingAck(publish) => {
                    self.state.reserve_packet_id(record_id(&publish));
                    self.tokens.restore(&publish)?;
                    queue.push(Outbound::new(Packet::Publish(publish.with_dup(true))))?;
                }
                InflightRecord::AwaitingPubComp { pubrel, publish } => {
                    self.state.reserve_packet_id(pubrel.packet_id);
                    self.restore_pubcomp_token(pubrel.packet_id, publish.as_ref())?;
                    queue.push(Outbound::new(Packet::PubRel(pubrel)))?;
                }
                InflightRecord::AwaitingRelease(_) => continue,
            }
            resent += 1;
        }
        if resent > 0 {
            info!(count = resent, "Resuming in-flight messages");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Outbound operations
    // ---------------------------------------------------------------------

    /// Queue of the live connection, if operations are currently accepted
    fn active_queue(&self) -> Result<Arc<OutboundQueue>> {
        let inner = self.lock();
        if let Some(refusal) = inner.connection_state.refusal() {
            return Err(refusal);
        }
        inner
            .active
            .as_ref()
            .map(|active| active.queue.clone())
            .ok_or(MqttError::NotConnected)
    }

    /// Queue of connection `generation` while it is still alive, quiescing
    /// included
    fn queue_for(&self, generation: u64) -> Option<Arc<OutboundQueue>> {
        self.lock()
            .active
            .as_ref()
            .filter(|active| active.generation == generation)
            .map(|active| active.queue.clone())
    }

    fn send_on(&self, generation: u64, packet: Packet) -> Result<()> {
        match self.queue_for(generation) {
            Some(queue) => queue.push(Outbound::new(packet)),
            None => Ok(()),
        }
    }

    fn check_outgoing(&self, packet: &Packet) -> Result<()> {
        let size = PacketCodec::new(self.state.version()).encoded_len(packet)?;
        self.state.check_outgoing_size(size)
    }

    /// Starts a publish. `QoS` 0 tokens complete once written, `QoS` 1/2
    /// tokens on the final acknowledgement.
    pub(crate) fn publish(&self, publish: PublishPacket) -> Result<Token> {
        validate_topic_name(&publish.topic_name)?;
        let queue = self.active_queue()?;

        if publish.qos == QoS::AtMostOnce {
            let packet = Packet::Publish(publish.clone());
            self.check_outgoing(&packet)?;
            let token = Token::new(String::new(), TokenKind::Publish);
            token.set_message(publish);
            queue.push(Outbound::with_token(packet, token.clone()))?;
            return Ok(token);
        }

        let id = self.state.next_packet_id()?;
        let publish = publish.with_packet_id(id);
        let packet = Packet::Publish(publish.clone());
        if let Err(e) = self.check_outgoing(&packet) {
            self.state.release_packet_id(id);
            return Err(e);
        }

        let token = Token::for_delivery(publish.clone());
        let quota = self.state.server_receive_maximum();
        if let Err(e) = self.tokens.save_delivery(&token, quota) {
            self.state.release_packet_id(id);
            return Err(e);
        }
        let queued = self
            .inflight
            .persist_outbound(&publish)
            .and_then(|()| queue.push(Outbound::with_token(packet, token.clone())));
        if let Err(e) = queued {
            self.abandon_delivery(id, &token, e.clone());
            return Err(e);
        }
        debug!(packet_id = id, qos = ?publish.qos, topic = %publish.topic_name, "Publish queued");
        Ok(token)
    }

    /// Starts a subscribe. `listeners` pairs with `filters`; a `None` entry
    /// leaves that filter to the client callback.
    pub(crate) fn subscribe(
        &self,
        filters: Vec<TopicFilter>,
        listeners: Vec<Option<MessageListener>>,
    ) -> Result<Token> {
        if filters.is_empty() {
            return Err(MqttError::InvalidArgument(
                "subscribe needs at least one filter".to_string(),
            ));
        }
        if !listeners.is_empty() && listeners.len() != filters.len() {
            return Err(MqttError::InvalidArgument(format!(
                "{} filters but {} listeners",
                filters.len(),
                listeners.len()
            )));
        }
        for filter in &filters {
            validate_topic_filter(&filter.filter)?;
        }
        let queue = self.active_queue()?;

        let id = self.state.next_packet_id()?;
        let topics: Vec<String> = filters.iter().map(|f| f.filter.clone()).collect();
        let packet = Packet::Subscribe(
            filters
                .into_iter()
                .fold(SubscribePacket::new(id), SubscribePacket::add_filter_with_options),
        );
        if let Err(e) = self.check_outgoing(&packet) {
            self.state.release_packet_id(id);
            return Err(e);
        }

        // Registered before sending so retained messages that follow the
        // SUBACK already find their listener
        for (topic, listener) in topics.iter().zip(listeners) {
            if let Some(listener) = listener {
                self.listeners.register(topic, listener);
            }
        }

        let token = Token::new(key_for_id(id), TokenKind::Subscribe);
        token.set_topics(topics.clone());
        let queued = self
            .tokens
            .save(&token)
            .and_then(|()| queue.push(Outbound::with_token(packet, token.clone())));
        if let Err(e) = queued {
            self.tokens.remove(token.key());
            self.state.release_packet_id(id);
            for topic in &topics {
                self.listeners.unregister(topic);
            }
            token.fail(e.clone());
            return Err(e);
        }
        debug!(packet_id = id, ?topics, "Subscribe queued");
        Ok(token)
    }

    /// Starts an unsubscribe; listeners for `filters` are removed at once
    pub(crate) fn unsubscribe(&self, filters: &[&str]) -> Result<Token> {
        if filters.is_empty() {
            return Err(MqttError::InvalidArgument(
                "unsubscribe needs at least one filter".to_string(),
            ));
        }
        for filter in filters {
            validate_topic_filter(filter)?;
        }
        let queue = self.active_queue()?;

        let id = self.state.next_packet_id()?;
        let packet = Packet::Unsubscribe(
            filters
                .iter()
                .fold(UnsubscribePacket::new(id), |packet, f| packet.add_filter(*f)),
        );
        if let Err(e) = self.check_outgoing(&packet) {
            self.state.release_packet_id(id);
            return Err(e);
        }
        for filter in filters {
            self.listeners.unregister(filter);
        }

        let token = Token::new(key_for_id(id), TokenKind::Unsubscribe);
        token.set_topics(filters.iter().map(ToString::to_string).collect());
        let queued = self
            .tokens
            .save(&token)
            .and_then(|()| queue.push(Outbound::with_token(packet, token.clone())));
        if let Err(e) = queued {
            self.tokens.remove(token.key());
            self.state.release_packet_id(id);
            token.fail(e.clone());
            return Err(e);
        }
        Ok(token)
    }

    /// Queues a PINGREQ on connection `generation`
    ///
    /// A ping token still waiting for its PINGRESP is kept; the next
    /// PINGRESP completes it.
    pub(crate) fn send_ping(&self, generation: u64) -> Result<()> {
        let queue = self.queue_for(generation).ok_or(MqttError::NotConnected)?;
        let outbound = if self.tokens.contains_key(PING_KEY) {
            Outbound::new(Packet::PingReq)
        } else {
            let token = Token::new(PING_KEY, TokenKind::Ping);
            // A quiesced store refuses the token; the ping still goes out
            match self.tokens.save(&token) {
                Ok(()) => Outbound::with_token(Packet::PingReq, token),
                Err(_) => Outbound::new(Packet::PingReq),
            }
        };
        self.state.note_ping_sent();
        queue.push(outbound)
    }

    /// The writer could not send `outbound` but the connection is fine;
    /// only that operation fails
    pub(crate) fn abandon(&self, outbound: &Outbound, cause: MqttError) {
        warn!(
            packet_type = ?outbound.packet.packet_type(),
            error = %cause,
            "Dropping packet that cannot be sent"
        );
        let Some(token) = &outbound.token else {
            return;
        };
        match &outbound.packet {
            Packet::Publish(publish) if publish.qos != QoS::AtMostOnce => {
                self.abandon_delivery(record_id(publish), token, cause);
                return;
            }
            Packet::Subscribe(subscribe) => {
                for filter in &subscribe.filters {
                    self.listeners.unregister(&filter.filter);
                }
            }
            _ => {}
        }
        if let Some(id) = outbound.packet.packet_id() {
            self.state.release_packet_id(id);
        }
        if !token.key().is_empty() {
            self.tokens.remove(token.key());
        }
        token.fail(cause);
    }

    fn abandon_delivery(&self, id: u16, token: &Token, cause: MqttError) {
        if let Some(stored) = self.tokens.get(token.key()) {
            if stored.same_as(token) {
                self.tokens.remove(token.key());
            }
        }
        if let Err(e) = self.inflight.remove_outbound(id) {
            warn!(packet_id = id, error = %e, "Failed to remove persisted publish");
        }
        self.state.release_packet_id(id);
        token.fail(cause);
    }

    // ---------------------------------------------------------------------
    // Inbound dispatch
    // ---------------------------------------------------------------------

    /// Handles one packet read on connection `generation`
    ///
    /// # Errors
    ///
    /// Any error ends the connection: protocol violations, a server
    /// DISCONNECT, or a persistence failure in a QoS handshake
    pub(crate) fn handle_packet(&self, generation: u64, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.receive_publish(generation, publish),
            Packet::PubAck(ack) => {
                self.finish_delivery(ack.packet_id, ack.reason_code, Packet::PubAck(ack));
                Ok(())
            }
            Packet::PubRec(rec) => self.handle_pubrec(generation, rec),
            Packet::PubRel(rel) => self.handle_pubrel(generation, &rel),
            Packet::PubComp(comp) => {
                self.finish_delivery(comp.packet_id, comp.reason_code, Packet::PubComp(comp));
                Ok(())
            }
            Packet::SubAck(suback) => {
                self.handle_suback(suback);
                Ok(())
            }
            Packet::UnsubAck(unsuback) => {
                self.handle_unsuback(unsuback);
                Ok(())
            }
            Packet::PingResp => {
                if let Some(token) = self.tokens.remove(PING_KEY) {
                    token.complete(Some(Packet::PingResp));
                }
                Ok(())
            }
            Packet::Disconnect(disconnect) => {
                info!(reason_code = ?disconnect.reason_code, "Server sent DISCONNECT");
                Err(MqttError::ServerDisconnected(disconnect.reason_code))
            }
            Packet::ConnAck(_) => Err(MqttError::ProtocolError(
                "CONNACK received on an established connection".to_string(),
            )),
            Packet::Auth(_) => Err(MqttError::ProtocolError(
                "re-authentication is not supported".to_string(),
            )),
            other @ (Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => Err(MqttError::ProtocolError(format!(
                "server sent client-only packet {:?}",
                other.packet_type()
            ))),
        }
    }

    fn receive_publish(&self, generation: u64, publish: PublishPacket) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let id = record_id(&publish);
                self.deliver(publish);
                self.send_on(generation, Packet::PubAck(PubAckPacket::new(id)))
            }
            QoS::ExactlyOnce => {
                let id = record_id(&publish);
                if self.inflight.has_inbound(id)? {
                    debug!(packet_id = id, "Duplicate QoS 2 publish, acknowledging again");
                } else {
                    self.inflight.persist_inbound(&publish)?;
                }
                self.send_on(generation, Packet::PubRec(PubRecPacket::new(id)))
            }
        }
    }

    fn handle_pubrel(&self, generation: u64, pubrel: &PubRelPacket) -> Result<()> {
        let id = pubrel.packet_id;
        match self.inflight.inbound(id)? {
            Some(publish) => {
                self.deliver(publish);
                self.inflight.remove_inbound(id)?;
            }
            None => debug!(packet_id = id, "PUBREL for a message already released"),
        }
        self.send_on(generation, Packet::PubComp(PubCompPacket::new(id)))
    }

    fn handle_pubrec(&self, generation: u64, pubrec: PubRecPacket) -> Result<()> {
        let id = pubrec.packet_id;
        if pubrec.reason_code.is_error() {
            self.finish_delivery(id, pubrec.reason_code, Packet::PubRec(pubrec));
            return Ok(());
        }
        if !self.tokens.contains_key(&key_for_id(id)) {
            warn!(packet_id = id, "PUBREC for unknown packet id");
        }
        let pubrel = PubRelPacket::new(id);
        self.inflight.persist_pubrel(&pubrel)?;
        debug!(packet_id = id, "PUBREC received, releasing");
        self.send_on(generation, Packet::PubRel(pubrel))
    }

    /// Final step of an outbound QoS 1/2 handshake
    fn finish_delivery(&self, id: u16, reason_code: ReasonCode, ack: Packet) {
        let Some(token) = self.tokens.remove(&key_for_id(id)) else {
            warn!(packet_id = id, packet_type = ?ack.packet_type(), "Acknowledgement for unknown packet id");
            return;
        };
        if let Err(e) = self.inflight.remove_outbound(id) {
            warn!(packet_id = id, error = %e, "Failed to remove persisted publish");
        }
        self.state.release_packet_id(id);

        if reason_code.is_error() {
            debug!(packet_id = id, ?reason_code, "Publish refused by server");
            token.finish(Some(ack), Some(MqttError::PublishFailed(reason_code)));
            return;
        }
        token.complete(Some(ack));
        if let Some(callback) = self.callback() {
            callback.delivery_complete(&token);
        }
    }

    fn handle_suback(&self, suback: SubAckPacket) {
        let id = suback.packet_id;
        let Some(token) = self.tokens.remove(&key_for_id(id)) else {
            warn!(packet_id = id, "SUBACK for unknown packet id");
            return;
        };
        self.state.release_packet_id(id);
        for (topic, granted) in token.topics().iter().zip(suback.granted_qos()) {
            if granted.is_none() {
                debug!(%topic, "Subscription refused, removing its listener");
                self.listeners.unregister(topic);
            }
        }
        token.complete(Some(Packet::SubAck(suback)));
    }

    fn handle_unsuback(&self, unsuback: UnsubAckPacket) {
        let id = unsuback.packet_id;
        let Some(token) = self.tokens.remove(&key_for_id(id)) else {
            warn!(packet_id = id, "UNSUBACK for unknown packet id");
            return;
        };
        self.state.release_packet_id(id);
        token.complete(Some(Packet::UnsubAck(unsuback)));
    }

    fn deliver(&self, publish: PublishPacket) {
        let message = Message::from(publish);
        if self.listeners.dispatch(&message) {
            return;
        }
        if let Some(callback) = self.callback() {
            callback.message_arrived(&message);
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Reports that connection `generation` failed with `cause`
    ///
    /// Only the first report for a generation has any effect. During an
    /// application disconnect the loss just completes the shutdown.
    pub(crate) fn connection_lost(self: &Arc<Self>, generation: u64, cause: MqttError) {
        let teardown = match self.connection_state() {
            ConnectionState::Quiescing | ConnectionState::Disconnecting => Teardown::Disconnected,
            _ => Teardown::Lost,
        };
        if !self.shutdown(generation, &cause, teardown) || teardown != Teardown::Lost {
            return;
        }

        if cause.is_fatal() {
            error!(error = %cause, "Connection terminated");
        } else {
            info!(error = %cause, "Connection lost");
        }
        if let Some(callback) = self.callback() {
            callback.connection_lost(&cause);
        }

        let mut inner = self.lock();
        let reconnect = inner
            .options
            .as_ref()
            .is_some_and(|options| options.reconnect.enabled);
        if reconnect
            && is_recoverable(&cause)
            && inner.connection_state == ConnectionState::Disconnected
        {
            if let Some(previous) = inner.reconnect_task.take() {
                previous.abort();
            }
            inner.reconnect_task = Some(tokio::spawn(tasks::reconnect_task(self.clone())));
        }
    }

    /// Stops connection `generation` and settles the tokens it leaves
    /// behind. Returns false if that connection was already gone.
    fn shutdown(&self, generation: u64, cause: &MqttError, teardown: Teardown) -> bool {
        let active = {
            let mut inner = self.lock();
            if inner.active.as_ref().map(|a| a.generation) != Some(generation) {
                return false;
            }
            if inner.connection_state != ConnectionState::Closed {
                inner.connection_state = ConnectionState::Disconnected;
            }
            inner.active.take()
        };
        self.tokens.quiesce(cause.clone());

        if let Some(active) = active {
            active.abort();
            for mut outbound in active.queue.close() {
                if let Some(token) = outbound.token.take() {
                    if !token.is_delivery() {
                        token.fail(cause.clone());
                    }
                }
            }
        }

        self.fail_outstanding(cause, !self.state.clean_start());
        debug!(generation, ?teardown, "Connection shut down");
        true
    }

    /// Fails stored tokens; delivery tokens survive when `keep_delivery`
    fn fail_outstanding(&self, cause: &MqttError, keep_delivery: bool) {
        let failed = if keep_delivery {
            self.tokens.drain_where(|token| !token.is_delivery())
        } else {
            self.tokens.drain()
        };
        for token in failed {
            if let Ok(id) = token.key().parse::<u16>() {
                self.state.release_packet_id(id);
            }
            token.fail(cause.clone());
        }
    }

    /// Options for the next automatic reconnect attempt, `None` once the
    /// application took over (connected, disconnected or closed)
    pub(crate) fn reconnect_options(&self) -> Option<ConnectOptions> {
        let inner = self.lock();
        if inner.connection_state != ConnectionState::Disconnected {
            return None;
        }
        inner.options.clone()
    }

    /// Graceful disconnect: quiesce, drain, DISCONNECT, shut down
    ///
    /// Waits up to `quiesce` for outstanding operations and up to
    /// `disconnect_timeout` for the DISCONNECT to be written. The connection
    /// is shut down in every case.
    pub(crate) fn begin_disconnect(&self) -> Result<DisconnectStart> {
        let generation = {
            let mut inner = self.lock();
            if let Some(interrupted) = self.cancel_reconnect(&mut inner) {
                drop(inner);
                for token in interrupted {
                    token.fail(MqttError::Quiesced);
                }
                info!(client_id = %self.state.client_id(), "Automatic reconnect cancelled");
                let token = Token::new(DISCONNECT_KEY, TokenKind::Disconnect);
                token.complete(None);
                return Ok(DisconnectStart::Cancelled(token));
            }
            if let Some(refusal) = inner.connection_state.refusal() {
                return Err(refusal);
            }
            let generation = inner
                .active
                .as_ref()
                .map(|active| active.generation)
                .ok_or(MqttError::NotConnected)?;
            inner.connection_state = ConnectionState::Quiescing;
            generation
        };

        let token = Token::new(DISCONNECT_KEY, TokenKind::Disconnect);
        self.tokens.save(&token)?;
        self.tokens.quiesce(MqttError::Quiesced);
        info!(client_id = %self.state.client_id(), "Quiescing");
        Ok(DisconnectStart::Quiescing { generation, token })
    }

    pub(crate) async fn run_disconnect(
        self: Arc<Self>,
        generation: u64,
        token: Token,
        quiesce: Duration,
        disconnect_timeout: Duration,
    ) {
        let deadline = Instant::now() + quiesce;
        for pending in self.tokens.outstanding_tokens() {
            if matches!(pending.kind(), TokenKind::Disconnect | TokenKind::Ping) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let drained = !remaining.is_zero()
                && (pending.wait_for(remaining).await.is_ok() || pending.is_complete());
            if !drained {
                debug!("Quiesce timeout reached");
                break;
            }
        }

        let queue = {
            let mut inner = self.lock();
            if inner.active.as_ref().map(|a| a.generation) == Some(generation)
                && inner.connection_state == ConnectionState::Quiescing
            {
                inner.connection_state = ConnectionState::Disconnecting;
            }
            inner
                .active
                .as_ref()
                .filter(|active| active.generation == generation)
                .map(|active| active.queue.clone())
        };

        if let Some(queue) = queue {
            let sent = queue
                .push(Outbound::with_token(
                    Packet::Disconnect(DisconnectPacket::normal()),
                    token.clone(),
                ))
                .is_ok();
            if sent && token.wait_for(disconnect_timeout).await.is_err() && !token.is_complete() {
                warn!("DISCONNECT not written in time");
            }
        }

        self.tokens.remove(DISCONNECT_KEY);
        if !token.is_complete() {
            token.fail(MqttError::Timeout);
        }
        self.shutdown(generation, &MqttError::Quiesced, Teardown::Disconnected);
        info!(client_id = %self.state.client_id(), "Disconnected");
    }

    /// Terminal close. Every outstanding token fails with `ConnectionClosed`.
    pub(crate) fn close(&self, force: bool) -> Result<()> {
        let (active, interrupted) = {
            let mut inner = self.lock();
            let interrupted = self.cancel_reconnect(&mut inner).unwrap_or_default();
            match inner.connection_state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Disconnected => {}
                other if !force => {
                    return Err(MqttError::InvalidState(format!(
                        "cannot close while {other:?}, disconnect first"
                    )))
                }
                _ => {}
            }
            inner.connection_state = ConnectionState::Closed;
            (inner.active.take(), interrupted)
        };

        self.tokens.quiesce(MqttError::ConnectionClosed);
        for token in interrupted {
            token.fail(MqttError::ConnectionClosed);
        }
        if let Some(active) = active {
            active.abort();
            for mut outbound in active.queue.close() {
                if let Some(token) = outbound.token.take() {
                    token.fail(MqttError::ConnectionClosed);
                }
            }
        }
        self.fail_outstanding(&MqttError::ConnectionClosed, false);
        self.listeners.clear();
        self.inflight.persistence().close()?;
        info!(client_id = %self.state.client_id(), "Client closed");
        Ok(())
    }

    /// Outstanding `QoS` 1/2 publish tokens, in packet id order
    pub(crate) fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.tokens.outstanding_delivery_tokens()
    }

    /// Called by the writer once a packet is on the wire
    pub(crate) fn packet_written(&self, outbound: &Outbound) {
        let Some(token) = &outbound.token else {
            return;
        };
        match token.kind() {
            TokenKind::Publish => {
                token.complete(None);
            }
            TokenKind::Disconnect => {
                self.tokens.remove(DISCONNECT_KEY);
                token.complete(None);
            }
            _ => {}
        }
    }
}

/// Packet id of a publish read back from storage or the wire at `QoS` > 0,
/// where the codec guarantees it is present
fn record_id(publish: &PublishPacket) -> u16 {
    publish.packet_id.unwrap_or_default()
}

impl std::fmt::Debug for ClientComms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientComms")
            .field("client_id", &self.state.client_id())
            .field("connection_state", &self.connection_state())
            .field("tokens", &self.tokens.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::transport::{MockBroker, MockBrokerListener, MockTransport};

    const WAIT: Duration = Duration::from_secs(5);

    async fn connected(client_id: &str) -> (Arc<ClientComms>, MockBrokerListener, MockBroker) {
        let (transport, mut listener) = MockTransport::new();
        let comms = Arc::new(
            ClientComms::new(
                client_id,
                Arc::new(transport),
                Arc::new(MemoryPersistence::new()),
            )
            .unwrap(),
        );
        // Pings are driven by hand below
        let options = ConnectOptions::new(client_id).with_keep_alive(Duration::ZERO);
        let token = comms.begin_connect(&options).unwrap();
        let attempt = tokio::spawn(comms.clone().run_connect(options, token, false));
        let mut broker = listener.accept_within(WAIT).await.unwrap();
        broker.accept_connect(false).await.unwrap();
        attempt.await.unwrap().unwrap();
        (comms, listener, broker)
    }

    #[tokio::test]
    async fn test_unanswered_ping_token_is_reused() {
        let (comms, _listener, mut broker) = connected("comms-ping").await;

        comms.send_ping(1).unwrap();
        assert_eq!(broker.recv().await.unwrap(), Packet::PingReq);
        let first = comms.tokens().get(PING_KEY).unwrap();

        // Other traffic arrived meanwhile, so the keep-alive pings again
        comms.send_ping(1).unwrap();
        assert_eq!(broker.recv().await.unwrap(), Packet::PingReq);
        assert!(comms.tokens().get(PING_KEY).unwrap().same_as(&first));
        assert_eq!(comms.tokens().count(), 1);

        broker.send(&Packet::PingResp).await.unwrap();
        first.wait_for(WAIT).await.unwrap();
        assert!(!comms.tokens().contains_key(PING_KEY));
    }
}
