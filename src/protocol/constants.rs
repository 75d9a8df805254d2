//! Forward Protocol Constants

// Scheme separator in forward addresses
pub const SCHEME_SEPARATOR: &str = "://";

// Recognized schemes
pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_RESP: &str = "resp";

// Synthetic upstream-failure responses
pub const HTTP_BAD_GATEWAY: &[u8] = b"HTTP/1.0 502 Bad Gateway\r\n\r\n";
pub const RESP_BAD_GATEWAY: &[u8] = b"-ERR bad gateway\r\n";
