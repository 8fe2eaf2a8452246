/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller,
//! subsystem-specific config structs before being passed to components.
//!
//! A configuration can be built directly, or parsed from the key/value dictionary
//! form with [`Configuration::from_entries`]. Recognized keys are those named by the
//! runtime's external interface: `local_id`, `local_ip`, `gms_port`, `rpc_port`,
//! `sst_port`, `rdma_port`, `contact_ip`, `contact_port`, `max_payload_size`,
//! `window_size`, `rdma_provider`, `persistence_enabled`, `state_transfer_batch`,
//! `suspicion_timeout_ms`, `log_events`.

use crate::types::basic::{NodeId, WindowSize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub multicast: MulticastConfig,
    pub membership: MembershipConfig,
    pub persistence: PersistenceConfig,
    /// Enables the default CSV logging handlers on the event bus.
    pub log_events: bool,
}

/// This node's identity and transport endpoints.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub local_id: NodeId,
    pub local_ip: Ipv4Addr,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub rdma_port: u16,
    /// Transport backend selection, forwarded to the fabric provider.
    pub rdma_provider: String,
}

/// Tuning for the ordered multicast engine.
#[derive(Clone, Debug)]
pub struct MulticastConfig {
    /// Bytes per ordered message.
    pub max_payload_size: usize,
    /// In-flight messages per sender per subgroup.
    pub window_size: WindowSize,
}

/// Tuning for the group management service.
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// Leader address for joining an existing group. `None` on founding members.
    pub contact: Option<(Ipv4Addr, u16)>,
    /// A peer whose liveness frontier has not advanced for this long is suspected.
    pub suspicion_timeout: Duration,
    /// Cadence of the core thread's periodic duties (frontier refresh, timeout scan).
    pub heartbeat_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    /// Turns on the persistence hook: deliveries in persistent subgroups are
    /// versioned and handed to the durable store.
    pub enabled: bool,
    /// Joining-node state transfer chunk size, in bytes.
    pub state_transfer_batch: usize,
}

impl Configuration {
    /// A configuration with the stock tuning values, for the given node identity.
    pub fn new(local_id: NodeId) -> Configuration {
        Configuration {
            identity: IdentityConfig {
                local_id,
                local_ip: Ipv4Addr::LOCALHOST,
                gms_port: 23580,
                rpc_port: 23581,
                sst_port: 23582,
                rdma_port: 23583,
                rdma_provider: String::from("sockets"),
            },
            multicast: MulticastConfig {
                max_payload_size: 10 * 1024,
                window_size: WindowSize::new(16),
            },
            membership: MembershipConfig {
                contact: None,
                suspicion_timeout: Duration::from_millis(2000),
                heartbeat_interval: Duration::from_millis(25),
            },
            persistence: PersistenceConfig {
                enabled: false,
                state_transfer_batch: 64 * 1024,
            },
            log_events: false,
        }
    }

    /// Build a configuration from the key/value dictionary form. Unrecognized keys
    /// and malformed values are rejected with a description of the offending entry.
    pub fn from_entries(entries: &HashMap<String, String>) -> Result<Configuration, String> {
        let local_id = match entries.get("local_id") {
            Some(v) => NodeId::new(parse(v, "local_id")?),
            None => return Err(String::from("missing required option local_id")),
        };
        let mut config = Configuration::new(local_id);

        for (key, value) in entries {
            match key.as_str() {
                "local_id" => {}
                "local_ip" => {
                    config.identity.local_ip = value
                        .parse()
                        .map_err(|_| format!("malformed value for local_ip: {value}"))?
                }
                "gms_port" => config.identity.gms_port = parse(value, key)?,
                "rpc_port" => config.identity.rpc_port = parse(value, key)?,
                "sst_port" => config.identity.sst_port = parse(value, key)?,
                "rdma_port" => config.identity.rdma_port = parse(value, key)?,
                "rdma_provider" => config.identity.rdma_provider = value.clone(),
                "contact_ip" => {
                    let ip = value
                        .parse()
                        .map_err(|_| format!("malformed value for contact_ip: {value}"))?;
                    let port = config.membership.contact.map(|(_, p)| p).unwrap_or(0);
                    config.membership.contact = Some((ip, port));
                }
                "contact_port" => {
                    let port = parse(value, key)?;
                    let ip = config
                        .membership
                        .contact
                        .map(|(ip, _)| ip)
                        .unwrap_or(Ipv4Addr::LOCALHOST);
                    config.membership.contact = Some((ip, port));
                }
                "max_payload_size" => config.multicast.max_payload_size = parse(value, key)?,
                "window_size" => {
                    config.multicast.window_size = WindowSize::new(parse(value, key)?)
                }
                "persistence_enabled" => {
                    config.persistence.enabled = value
                        .parse()
                        .map_err(|_| format!("malformed value for persistence_enabled: {value}"))?
                }
                "state_transfer_batch" => {
                    config.persistence.state_transfer_batch = parse(value, key)?
                }
                "suspicion_timeout_ms" => {
                    config.membership.suspicion_timeout = Duration::from_millis(parse(value, key)?)
                }
                "log_events" => {
                    config.log_events = value
                        .parse()
                        .map_err(|_| format!("malformed value for log_events: {value}"))?
                }
                other => return Err(format!("unrecognized option {other}")),
            }
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("malformed value for {key}: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn from_entries_applies_recognized_options() {
        let config = Configuration::from_entries(&entries(&[
            ("local_id", "7"),
            ("local_ip", "10.0.0.3"),
            ("window_size", "32"),
            ("persistence_enabled", "true"),
            ("contact_ip", "10.0.0.1"),
            ("contact_port", "23580"),
        ]))
        .unwrap();

        assert_eq!(config.identity.local_id, NodeId::new(7));
        assert_eq!(config.identity.local_ip, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(config.multicast.window_size, WindowSize::new(32));
        assert!(config.persistence.enabled);
        assert_eq!(
            config.membership.contact,
            Some((Ipv4Addr::new(10, 0, 0, 1), 23580))
        );
    }

    #[test]
    fn from_entries_rejects_unknown_keys_and_bad_values() {
        assert!(Configuration::from_entries(&entries(&[("local_id", "7"), ("bogus", "1")]))
            .is_err());
        assert!(
            Configuration::from_entries(&entries(&[("local_id", "7"), ("window_size", "wide")]))
                .is_err()
        );
        assert!(Configuration::from_entries(&entries(&[("local_ip", "10.0.0.3")])).is_err());
    }
}
