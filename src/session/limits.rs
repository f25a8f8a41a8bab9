use crate::error::{MqttError, Result};

/// Packet size limits for one connection
///
/// The incoming limit is the one this client advertised in CONNECT; the
/// outgoing limit comes from the server's CONNACK. `None` leaves the
/// protocol maximum in force.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSizeLimits {
    pub max_incoming: Option<u32>,
    pub max_outgoing: Option<u32>,
}

impl PacketSizeLimits {
    /// Creates limits advertising `max_incoming`, with no outgoing limit yet
    #[must_use]
    pub fn new(max_incoming: Option<u32>) -> Self {
        Self {
            max_incoming: max_incoming.filter(|max| *max > 0),
            max_outgoing: None,
        }
    }

    /// Sets the server's maximum packet size from CONNACK
    pub fn set_server_maximum(&mut self, size: Option<u32>) {
        self.max_outgoing = size.filter(|max| *max > 0);
    }

    /// # Errors
    ///
    /// `PacketTooLarge` if `size` exceeds what the server accepts
    pub fn check_outgoing(&self, size: usize) -> Result<()> {
        match self.max_outgoing {
            Some(max) if size > max as usize => Err(MqttError::PacketTooLarge {
                size,
                max: max as usize,
            }),
            _ => Ok(()),
        }
    }

    /// # Errors
    ///
    /// `IncomingPacketTooLarge` if `size` exceeds what this client advertised
    pub fn check_incoming(&self, size: usize) -> Result<()> {
        match self.max_incoming {
            Some(max) if size > max as usize => Err(MqttError::IncomingPacketTooLarge {
                size,
                max: max as usize,
            }),
            _ => Ok(()),
        }
    }
}
