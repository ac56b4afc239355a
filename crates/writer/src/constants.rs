/// Exit code when a posting key fails to load or the chain rejects our
/// posting authority.
pub const EXIT_INVALID_POSTING_KEY: i32 = 20;

/// Exit code for any other startup failure.
pub const EXIT_UNKNOWN_STARTUP_FAILURE: i32 = 10;

/// Exit code after an immediate (second ctrl-c) shutdown.
pub const EXIT_INTERRUPTED: i32 = 130;
