/// Maximum live reservations the table will hold.
pub const MAX_RESERVATIONS: usize = 100_000;

/// Maximum byte length of a student id (non-strict mode).
pub const MAX_STUDENT_ID_LEN: usize = 32;

/// Maximum byte length of a display name.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum byte length of a station name.
pub const MAX_STATION_LEN: usize = 128;

/// Maximum number of configured stations.
pub const MAX_STATIONS: usize = 64;

/// Maximum byte length of a single SQL statement accepted over the wire.
pub const MAX_SQL_LEN: usize = 16 * 1024;

/// Maximum `LISTEN` channels a single connection may hold.
pub const MAX_LISTEN_CHANNELS: usize = 8;

/// Strict student ids are exactly this many ASCII digits.
pub const STRICT_STUDENT_ID_DIGITS: usize = 9;

/// Authentication codes are exactly this many ASCII digits.
pub const AUTH_CODE_DIGITS: usize = 4;
