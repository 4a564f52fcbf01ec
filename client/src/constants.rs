pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
