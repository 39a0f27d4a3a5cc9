//! Protocol and sizing constants shared by the client and server.

/// Capacity of the circular correlation stores. An in-flight packet is
/// addressable until a packet this many sequence numbers later evicts
/// its slot.
pub const MAX_SEQUENCE_NUMBERS: u32 = 50_000;

/// Largest accepted packet size on the wire.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Smallest accepted packet size.
pub const MIN_PACKET_SIZE: usize = 12;

/// Client payload: 4-byte sequence number plus 4-byte reply port.
pub const ORIGINAL_PACKET_SIZE: usize = 8;

/// Server reply payload: the echoed 4-byte sequence number.
pub const RETURN_PACKET_SIZE: usize = 4;

/// Maximum packets per batched send/receive on the hot path.
pub const BATCH_SIZE: usize = 128;

/// Send/receive socket buffer size (16 MB).
pub const MAX_SOCKET_BUFFER: usize = 16 * 1024 * 1024;

/// Ancillary-data buffer size for recvmsg control messages.
pub const CMSG_BUFFER_SIZE: usize = 1024;

/// Maximum error-queue entries drained per collector pass.
pub const TX_TIMESTAMP_BATCH_SIZE: usize = 256;

/// Collector polling interval in microseconds.
pub const TX_POLL_INTERVAL_US: u64 = 500;

/// Collector polls between error-queue health checks.
pub const TX_HEALTH_CHECK_INTERVAL: u64 = 1000;

/// CSV ring-buffer capacity (entries, power of two).
pub const CSV_RING_SIZE: usize = 1_048_576;

/// CSV entries formatted and written per batch.
pub const CSV_BATCH_SIZE: usize = 10_000;

/// CSV writer idle sleep in microseconds when its ring is empty.
pub const CSV_IDLE_SLEEP_US: u64 = 10;

/// Hot-loop iterations between wall-clock/duration checks.
pub const MAX_ITERATION_CHECK_INTERVAL: u32 = 50;

/// Seconds' worth of cycles after which a wall-clock check is forced
/// even if the iteration budget has not been reached.
pub const CHECK_INTERVAL_SECONDS: f64 = 0.1;

/// SO_BUSY_POLL timeout in microseconds.
pub const BUSY_POLL_US: u32 = 50;

/// SO_PRIORITY applied to packet-path sockets.
pub const SOCKET_PRIORITY: u32 = 7;

/// Default return-packet dispatch queue capacity.
pub const REPLY_QUEUE_SIZE: usize = 4096;

/// Deltas above this many microseconds are counted as outliers.
pub const DELTA_OUTLIER_CEILING_US: f64 = 1_000_000.0;

/// Deltas below this many microseconds are discarded as noise.
pub const DELTA_MIN_US: f64 = 0.001;
