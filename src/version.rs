// Centralized version information

// Display version - shown in the boot log
// Update this when making significant changes
pub const DISPLAY_VERSION: &str = "v0.7-sdota";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("{} ({})", DISPLAY_VERSION, CARGO_VERSION)
}
