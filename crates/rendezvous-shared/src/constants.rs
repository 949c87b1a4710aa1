/// Sender/receiver name used for envelopes originating at the server.
pub const SERVER_NAME: &str = "SERVER";

/// Default well-known port the rendezvous server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default port for the admin HTTP API.
pub const DEFAULT_HTTP_PORT: u16 = 8081;

/// Presence broadcast period in seconds.
pub const BROADCAST_INTERVAL_SECS: u64 = 30;

/// Outbound TCP connect timeout in seconds (client->server and peer->peer).
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Maximum number of transfer jobs doing I/O at the same time.
pub const MAX_CONCURRENT_TRANSFERS: usize = 10;

/// Size of one chunk in the peer-to-peer file copy.
pub const TRANSFER_CHUNK_SIZE: usize = 4096;

/// Largest length-prefixed record accepted on any stream (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Prefix given to every file stored in the download directory.
pub const RECEIVED_FILE_PREFIX: &str = "received_";

/// Content strings carried by `FILE_TRANSFER_RESPONSE`.
pub const DECISION_ACCEPT: &str = "ACCEPT";
pub const DECISION_REJECT: &str = "REJECT";
