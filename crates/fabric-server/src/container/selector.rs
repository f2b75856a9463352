//! Choosing one backend instance for a packet.

use fabric_core::packet::Header;
use fabric_core::registration::ServiceRegistration;

pub trait Selector: Send + Sync {
    /// Id of the instance that should handle `header`, or `None` when
    /// `services` is empty.
    fn lookup(&self, header: &Header, services: &[ServiceRegistration]) -> Option<String>;
}

/// CRC-32 of the routing key modulo the instance count.
///
/// The routing key is the channel id, or the destination when the packet has
/// no channel. This is a plain modulo hash, not a consistent-hash ring: when
/// the instance count changes most keys move to a different instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

pub fn hash_code(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

impl Selector for HashSelector {
    fn lookup(&self, header: &Header, services: &[ServiceRegistration]) -> Option<String> {
        if services.is_empty() {
            return None;
        }
        let key = if header.channel_id.is_empty() {
            &header.dest
        } else {
            &header.channel_id
        };
        let idx = hash_code(key) as usize % services.len();
        Some(services[idx].id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::wire::Protocol;

    fn services(n: usize) -> Vec<ServiceRegistration> {
        (0..n)
            .map(|i| ServiceRegistration::new(format!("chat-{i}"), "chat", "127.0.0.1", 9000 + i as u16, Protocol::Tcp))
            .collect()
    }

    fn header(channel: &str, dest: &str) -> Header {
        Header {
            channel_id: channel.into(),
            dest: dest.into(),
            ..Default::default()
        }
    }

    #[test]
    fn lookup_is_deterministic() {
        let srvs = services(5);
        let h = header("gw1_acct1_3", "");
        let first = HashSelector.lookup(&h, &srvs).unwrap();
        for _ in 0..50 {
            assert_eq!(HashSelector.lookup(&h, &srvs).unwrap(), first);
        }
    }

    #[test]
    fn matches_crc32_modulo() {
        let srvs = services(3);
        let h = header("ch-42", "");
        let expected = format!("chat-{}", crc32fast::hash(b"ch-42") % 3);
        assert_eq!(HashSelector.lookup(&h, &srvs).unwrap(), expected);
    }

    #[test]
    fn falls_back_to_dest() {
        let srvs = services(4);
        let expected = format!("chat-{}", hash_code("acct9") % 4);
        assert_eq!(HashSelector.lookup(&header("", "acct9"), &srvs).unwrap(), expected);
    }

    #[test]
    fn empty_set_has_no_choice() {
        assert!(HashSelector.lookup(&header("x", ""), &[]).is_none());
    }

    #[test]
    fn keys_spread_over_instances() {
        let srvs = services(4);
        let mut hit = std::collections::HashSet::new();
        for i in 0..200 {
            hit.insert(HashSelector.lookup(&header(&format!("ch{i}"), ""), &srvs).unwrap());
        }
        assert_eq!(hit.len(), 4);
    }
}
