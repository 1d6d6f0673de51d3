/// Utility functions and helpers
pub mod arena;
pub mod lists;

pub use arena::{Arena, ArenaFull, ArenaKey, ArenaLimits, Key};
pub use lists::StateLists;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Numeric value of a peer address, used to spread clients across nodes
pub fn addr_weight(addr: &SocketAddr) -> u64 {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => u32::from(v4) as u64,
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            (bits as u64) ^ ((bits >> 64) as u64)
        }
    };
    ip.wrapping_add(addr.port() as u64)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_addr_weight() {
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1001".parse().unwrap();
        assert_eq!(addr_weight(&b), addr_weight(&a) + 1);
        assert_eq!(addr_weight(&a), 0x0a00_0001 + 1000);
    }
}
