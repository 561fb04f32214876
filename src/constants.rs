use std::time::Duration;

pub const DNS_PORT: u16 = 53;

/// Per-query deadline before a server is considered unresponsive.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Well-known public recursive resolvers used when no servers are configured.
pub const DEFAULT_SERVERS: [&str; 4] = [
    "8.8.8.8:53",
    "8.8.4.4:53",
    "208.67.222.222:53",
    "208.67.220.220:53",
];

pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

/// TTL applied to NXDOMAIN / NoData entries.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(15);

/// Consecutive failures on one server before its channel is retired.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Send and receive buffer size requested for each upstream socket.
pub const SOCKET_BUFFER_BYTES: usize = 1 << 20;

/// Largest datagram accepted on the read path (EDNS-sized).
pub const MAX_DATAGRAM_BYTES: usize = 4096;

pub const DEFAULT_VALIDATION_CANARY: &str = "google.com";

// Presentation-form limits: 255 wire octets less the root label and length byte.
pub const MAX_NAME_LENGTH: usize = 253;
pub const MAX_LABEL_LENGTH: usize = 63;
