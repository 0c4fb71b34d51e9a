pub mod args;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Clean shutdown
    pub const SUCCESS: u8 = 0;
    /// Could not bind or accept on the listen address
    pub const NETWORK_ERROR: u8 = 1;
}
