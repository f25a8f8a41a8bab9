//! Background async tasks for MQTT client
//!
//! This module contains async tasks for background operations.
//! Each task is a simple async function that performs one specific job and
//! reports back to [`ClientComms`] with the connection generation it was
//! started for.

use crate::client::comms::ClientComms;
use crate::client::{is_recoverable, RetryState};
use crate::error::MqttError;
use crate::network::{NetworkReader, NetworkWriter, OutboundQueue};
use crate::packet::Packet;
use crate::session::KeepAliveAction;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

/// Packet reader task - continuously reads packets from the transport
///
/// This task:
/// 1. Reads a packet, yielding on read timeouts
/// 2. Hands it to the dispatcher
/// 3. Repeats until the connection fails
pub async fn reader_task(mut reader: NetworkReader, comms: Arc<ClientComms>, generation: u64) {
    loop {
        let packet = match reader.read_packet().await {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, generation, "Reader stopped");
                comms.connection_lost(generation, e);
                return;
            }
        };

        if let Err(e) = comms.handle_packet(generation, packet) {
            if e.is_fatal() {
                error!(error = %e, "Error handling packet");
            }
            comms.connection_lost(generation, e);
            return;
        }
    }
}

/// Packet writer task - writes queued packets in FIFO order
///
/// A packet that cannot be sent (too large for the server) fails only its
/// own operation. Write errors end the connection.
pub async fn writer_task(
    mut writer: NetworkWriter,
    queue: Arc<OutboundQueue>,
    comms: Arc<ClientComms>,
    generation: u64,
) {
    loop {
        let outbound = queue.pop().await;
        match writer.write_packet(&outbound.packet).await {
            Ok(_) => {
                comms.packet_written(&outbound);
                if matches!(outbound.packet, Packet::Disconnect(_)) {
                    writer.shutdown().await;
                    return;
                }
            }
            Err(e @ MqttError::PacketTooLarge { .. }) => comms.abandon(&outbound, e),
            Err(e) => {
                debug!(error = %e, generation, "Writer stopped");
                comms.connection_lost(generation, e);
                return;
            }
        }
    }
}

/// Keepalive task - sends PINGREQ when the connection goes idle
///
/// This task:
/// 1. Sleeps until the next keep-alive deadline
/// 2. Sends a PINGREQ, or declares the connection lost when the server
///    stayed silent for 1.5 times the interval
/// 3. Repeats until the connection is gone
pub async fn keepalive_task(comms: Arc<ClientComms>, generation: u64) {
    loop {
        match comms.state().keep_alive_check(Instant::now()) {
            KeepAliveAction::Disabled => return,
            KeepAliveAction::Wait(duration) => sleep(duration).await,
            KeepAliveAction::SendPing => {
                trace!("Sending PINGREQ");
                if comms.send_ping(generation).is_err() {
                    return;
                }
            }
            KeepAliveAction::Lost => {
                warn!(generation, "No traffic from server within keep alive");
                comms.connection_lost(generation, MqttError::KeepAliveTimeout);
                return;
            }
        }
    }
}

/// Reconnect task - retries the connection with exponential backoff
///
/// Runs on its own, so a hanging attempt never holds up anything else. Stops
/// when connected, when the application takes over, when the policy runs
/// out of attempts, or on an error a retry cannot fix.
pub async fn reconnect_task(comms: Arc<ClientComms>) {
    let mut retry = RetryState::new();
    loop {
        let Some(options) = comms.reconnect_options() else {
            return;
        };
        if !retry.should_retry(&options.reconnect) {
            warn!(attempts = retry.attempts, last_error = ?retry.last_error, "Giving up reconnecting");
            return;
        }

        let delay = retry.next_delay(&options.reconnect);
        info!(attempt = retry.attempts + 1, ?delay, "Reconnecting");
        sleep(delay).await;

        let Ok((options, token)) = comms.begin_reconnect() else {
            return;
        };
        match comms.clone().run_connect(options, token, true).await {
            Ok(()) => return,
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "Reconnect attempt failed");
                retry.record_attempt(e);
            }
            Err(e) => {
                error!(error = %e, "Reconnect failed with an unrecoverable error");
                return;
            }
        }
    }
}
