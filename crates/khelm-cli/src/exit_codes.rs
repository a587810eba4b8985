//! Exit codes of the khelm binary
//!
//! Follows sysexits.h where a code fits.

/// Success - manifests were rendered
pub const SUCCESS: u8 = 0;

/// General error - unspecified failure
pub const ERROR: u8 = 1;

/// Rendered resources violate the configured selectors or namespace policy
pub const VALIDATION_ERROR: u8 = 2;

/// A template failed to parse or render
pub const TEMPLATE_ERROR: u8 = 3;

/// Chart or version not found, lock out of sync or dependency cycle
pub const CHART_ERROR: u8 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: u8 = 5;

/// Repository is not trusted or not registered
pub const REPOSITORY_ERROR: u8 = 6;

/// Repository or registry could not be reached
pub const NETWORK_ERROR: u8 = 7;

/// Invalid arguments or chart configuration
pub const USAGE_ERROR: u8 = 64;

/// Interrupted by the user
pub const CANCELLED: u8 = 130;
