/// Format a `Duration` as a human-readable string with automatic unit scaling.
///
/// Produces output like `1.94ms`, `2.34s` using Rust's Debug format.
pub fn fmt_duration(d: std::time::Duration) -> String {
    format!("{d:.2?}")
}

/// Fingerprint of a request body for logging.
///
/// JSON-RPC parameter bodies may contain user content; log lines carry only
/// this hash, never the body itself.
pub fn body_fingerprint(body: &[u8]) -> String {
    format!("{:016x}", rapidhash::rapidhash(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_body_free() {
        let body = br#"{"jsonrpc":"2.0","method":"tools/call","params":{"secret":"hunter2"}}"#;
        let fp = body_fingerprint(body);
        assert_eq!(fp, body_fingerprint(body));
        assert_eq!(fp.len(), 16);
        assert!(!fp.contains("hunter2"));
        assert_ne!(fp, body_fingerprint(b"other"));
    }
}
