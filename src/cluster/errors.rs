//! Classification of cluster error replies.
//!
//! - `MOVED <slot> <host>:<port>` - the slot lives elsewhere; refresh topology
//! - `ASK <slot> <host>:<port>` - one-off redirect during slot migration
//! - `CLUSTERDOWN`, `TRYAGAIN` - transient cluster states

use crate::proto::error::Error;

/// Converts an error reply into a typed error.
///
/// Anything that is not a recognised cluster signal, including malformed
/// redirects, becomes [`Error::Server`].
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(args) = msg.strip_prefix("MOVED ") {
        if let Some((slot, address)) = parse_redirect(args) {
            return Error::Moved { slot, address };
        }
    }

    if let Some(args) = msg.strip_prefix("ASK ") {
        if let Some((slot, address)) = parse_redirect(args) {
            return Error::Ask { slot, address };
        }
    }

    if msg.starts_with("CLUSTERDOWN") {
        return Error::ClusterDown;
    }

    if msg.starts_with("TRYAGAIN") {
        return Error::TryAgain;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses redirect arguments: "<slot> <host>:<port>"
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some((slot, address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved_redirect() {
        match parse_redis_error(b"MOVED 3999 127.0.0.1:7000") {
            Error::Moved { slot, address } => {
                assert_eq!(slot, 3999);
                assert_eq!(address, "127.0.0.1:7000");
            }
            other => panic!("Expected Moved error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ask_redirect() {
        match parse_redis_error(b"ASK 12345 [2001:db8::1]:6379") {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 12345);
                assert_eq!(address, "[2001:db8::1]:6379");
            }
            other => panic!("Expected Ask error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_transient_states() {
        assert!(matches!(
            parse_redis_error(b"CLUSTERDOWN Hash slot not served"),
            Error::ClusterDown
        ));
        assert!(matches!(
            parse_redis_error(b"TRYAGAIN Multiple keys request during rehashing of slot"),
            Error::TryAgain
        ));
    }

    #[test]
    fn test_malformed_redirects_fall_back_to_server_error() {
        for raw in [
            &b"MOVED invalid 127.0.0.1:7000"[..],
            b"MOVED 3999",
            b"ASK 1 a:1 extra",
        ] {
            assert!(matches!(parse_redis_error(raw), Error::Server { .. }));
        }
    }

    #[test]
    fn test_parse_generic_error() {
        match parse_redis_error(b"  ERR unknown command  ") {
            Error::Server { message } => assert_eq!(message, "ERR unknown command"),
            other => panic!("Expected Server error, got {:?}", other),
        }
    }
}
