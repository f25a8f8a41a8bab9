//! Wire-level constants shared by the codec and the comms layer

/// Protocol name carried in every CONNECT variable header
pub const PROTOCOL_NAME: &str = "MQTT";

/// Bit masks for the first fixed header byte
pub mod masks {
    /// Mask for the packet type nibble
    pub const PACKET_TYPE: u8 = 0xF0;

    /// Mask for the flags nibble
    pub const FLAGS: u8 = 0x0F;

    /// Continuation bit of a variable byte integer
    pub const CONTINUATION_BIT: u8 = 0x80;

    /// Value bits of a variable byte integer
    pub const VARIABLE_BYTE_VALUE: u8 = 0x7F;
}

/// Fixed header flags required for packet types with reserved bits set
pub mod fixed_header {
    /// PUBREL, SUBSCRIBE and UNSUBSCRIBE carry 0b0010
    pub const RESERVED_0010: u8 = 0x02;
}

/// CONNECT flag bits
pub mod connect_flags {
    /// Username present
    pub const USERNAME: u8 = 0x80;
    /// Password present
    pub const PASSWORD: u8 = 0x40;
    /// Will message is retained
    pub const WILL_RETAIN: u8 = 0x20;
    /// Shift of the will `QoS` bits (bits 3-4)
    pub const WILL_QOS_SHIFT: u8 = 3;
    /// Mask for the will `QoS` after shifting
    pub const WILL_QOS_MASK: u8 = 0x03;
    /// Will message present
    pub const WILL_FLAG: u8 = 0x04;
    /// Clean start (clean session in 3.1.1)
    pub const CLEAN_START: u8 = 0x02;
    /// Reserved bit, must be zero
    pub const RESERVED: u8 = 0x01;
}

/// SUBSCRIBE option bits (v5)
pub mod subscription {
    /// Mask for `QoS` bits (bits 0-1)
    pub const QOS_MASK: u8 = 0x03;
    /// No local flag (bit 2)
    pub const NO_LOCAL_MASK: u8 = 0x04;
    /// Retain as published flag (bit 3)
    pub const RETAIN_AS_PUBLISHED_MASK: u8 = 0x08;
    /// Mask for retain handling (bits 4-5)
    pub const RETAIN_HANDLING_MASK: u8 = 0x30;
    /// Shift of the retain handling bits
    pub const RETAIN_HANDLING_SHIFT: u8 = 4;
    /// Reserved bits (6-7), must be zero
    pub const RESERVED_BITS_MASK: u8 = 0xC0;
}

pub mod limits {
    /// Largest length-prefixed string or binary blob
    pub const MAX_STRING_LENGTH: u16 = u16::MAX;

    /// Largest packet the fixed header can describe: one type byte, four
    /// length bytes and the maximum remaining length
    pub const MAX_PACKET_SIZE: u32 = 268_435_455 + 5;

    /// Payload chunk size used by the network writer
    pub const WRITE_CHUNK_SIZE: usize = 1024;
}
