//! Default controller identity
//!
//! A controller that is not named explicitly is assumed to run on this
//! machine, and controllers identify themselves by their hardware node id:
//! a network interface MAC address rendered as 16 upper-case hex digits.

use std::sync::OnceLock;

use sysinfo::Networks;

use crate::types::ControllerId;

/// Multicast bit of a 48-bit node id, set on randomly generated ids
const MULTICAST_BIT: u64 = 1 << 40;

const NODE_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Id of the controller running on this machine
///
/// Resolved once per process, so a random fallback stays stable.
pub fn default_controller_id() -> ControllerId {
    static ID: OnceLock<ControllerId> = OnceLock::new();
    ID.get_or_init(|| {
        let node = hardware_node().unwrap_or_else(|| {
            tracing::warn!("No network interface reports a MAC address, using a random node id");
            random_node()
        });
        format_node(node)
    })
    .clone()
}

/// First non-zero MAC address, interfaces taken in name order
fn hardware_node() -> Option<u64> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.list().iter().collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));

    interfaces.into_iter().find_map(|(name, data)| {
        let mac = data.mac_address();
        if mac.is_unspecified() {
            return None;
        }
        tracing::debug!(interface = %name, "Controller id derived from {}", mac);
        Some(mac.0.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    })
}

fn random_node() -> u64 {
    (rand::random::<u64>() & NODE_MASK) | MULTICAST_BIT
}

fn format_node(node: u64) -> ControllerId {
    ControllerId::new(format!("{:016X}", node & NODE_MASK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_node() {
        assert_eq!(format_node(0xd858_d700_1122).as_str(), "0000D858D7001122");
    }

    #[test]
    fn test_random_node_is_marked_multicast() {
        for _ in 0..16 {
            let node = random_node();
            assert_ne!(node & MULTICAST_BIT, 0);
            assert_eq!(node & !NODE_MASK, 0);
        }
    }

    #[test]
    fn test_default_id_is_stable() {
        let first = default_controller_id();
        assert_eq!(first, default_controller_id());
        assert_eq!(first.as_str().len(), 16);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
