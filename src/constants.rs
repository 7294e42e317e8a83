//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Routing Constants**: bundle layout
//! - **Network Constants**: frame size limits and default timeouts
//! - **Liveness Constants**: redo budget and heartbeat defaults
//! - **Path Constants**: coordination-store roots

// =============================================================================
// Routing Constants
// =============================================================================

/// Default number of bundles the u32 hash space is split into.
pub const DEFAULT_BUNDLE_COUNT: u32 = 16;

/// Upper bound on bundle count; a bundle must span at least one hash value.
pub const MAX_BUNDLE_COUNT: u32 = 1 << 16;

// =============================================================================
// Network Constants
// =============================================================================

/// Largest frame accepted by the TCP transport (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default broker listen port.
pub const DEFAULT_BROKER_PORT: u16 = 7100;

/// Default port of the HTTP health and metrics endpoint.
pub const DEFAULT_HEALTH_PORT: u16 = 7180;

/// Default deadline for a single RPC attempt, in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 3_000;

/// Default deadline for one push to a subscriber, in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 1_000;

/// Extra slack added to client deadlines around server-side waits.
pub const WAIT_DEADLINE_SLACK_MS: u64 = 500;

/// How many `NeedAllocation` redirects a lookup will follow.
pub const MAX_ALLOCATION_REDIRECTS: u32 = 3;

// =============================================================================
// Liveness Constants
// =============================================================================

/// Default redo budget (retries after the first attempt).
pub const DEFAULT_MAX_REDO: u32 = 3;

/// Default interval between alive-checks, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default number of consecutive failed alive-checks before a lease is revoked.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default deadline for one alive-check, in milliseconds.
pub const DEFAULT_ALIVE_CHECK_TIMEOUT_MS: u64 = 500;

// =============================================================================
// Storage Constants
// =============================================================================

/// Default number of messages kept in the in-memory delivery cache.
pub const DEFAULT_MESSAGE_CACHE_CAPACITY: u64 = 10_000;

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 249;

/// Maximum subscription or client name length.
pub const MAX_CLIENT_NAME_LENGTH: usize = 255;

// =============================================================================
// Path Constants
// =============================================================================

/// Default coordination-store root for broker registrations.
pub const DEFAULT_BROKER_ROOT: &str = "/brokers";

/// Default coordination-store root for topic descriptors.
pub const DEFAULT_TOPIC_ROOT: &str = "/topics";

/// Default coordination-store root for bundle descriptors.
pub const DEFAULT_BUNDLE_ROOT: &str = "/bundles";

/// Default coordination-store path of the cluster leader node.
pub const DEFAULT_LEADER_PATH: &str = "/leader";
