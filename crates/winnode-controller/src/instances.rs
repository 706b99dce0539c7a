//! Managed instance records and their derived lifecycle state
//!
//! Lifecycle state is never stored. It is recomputed on every pass from two
//! facts: whether a Node exists for the instance and the value of its
//! version annotation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::{Node, NodeAddress};

use winnode_common::{Error, Result, VERSION_ANNOTATION};

/// Weak association between an instance and its Node
///
/// The Node's lifetime belongs to the API server. The snapshot is whatever
/// was last read and may be absent until the caller loads it.
#[derive(Clone, Debug)]
pub struct NodeRef {
    /// Node name, the lookup key
    pub name: String,
    /// Last observed Node object
    pub snapshot: Option<Node>,
}

impl NodeRef {
    /// Reference a Node by name without a snapshot
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: None,
        }
    }

    /// Reference an observed Node
    pub fn from_node(node: Node) -> Self {
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            snapshot: Some(node),
        }
    }

    /// Annotation value from the snapshot
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.snapshot
            .as_ref()?
            .metadata
            .annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }
}

/// One host the controller manages
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    /// Address used to reach the host
    pub address: String,
    /// Remote user
    pub username: String,
    /// Hostname to apply; `None` leaves the hostname alone
    pub desired_hostname: Option<String>,
    /// Node for this host once it has joined
    pub node: Option<NodeRef>,
}

impl InstanceRecord {
    /// Create a record for a host that has not joined yet
    pub fn new(address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            desired_hostname: None,
            node: None,
        }
    }

    /// Request a hostname change. An empty name is the same as no request.
    pub fn with_desired_hostname(mut self, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        self.desired_hostname = (!hostname.is_empty()).then_some(hostname);
        self
    }

    /// Associate the record with a Node
    pub fn with_node(mut self, node: NodeRef) -> Self {
        self.node = Some(node);
        self
    }

    /// Name of the associated Node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.name.as_str())
    }

    fn version_annotation(&self) -> Option<&str> {
        self.node.as_ref()?.annotation(VERSION_ANNOTATION)
    }
}

/// Derived lifecycle state of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No Node exists for the host
    NotJoined,
    /// Node exists but configuration never completed
    PartiallyConfigured,
    /// Configured by the running version
    UpToDate,
    /// Configured by a different version
    UpgradeRequired,
}

impl LifecycleState {
    /// Whether the host takes the first-time configuration path
    pub fn needs_configuration(self) -> bool {
        matches!(self, Self::NotJoined | Self::PartiallyConfigured)
    }
}

/// Compute the lifecycle state of `record` relative to `version`
pub fn lifecycle_state(record: &InstanceRecord, version: &str) -> LifecycleState {
    if record.node.is_none() {
        return LifecycleState::NotJoined;
    }
    match record.version_annotation() {
        None => LifecycleState::PartiallyConfigured,
        Some(v) if v == version => LifecycleState::UpToDate,
        Some(_) => LifecycleState::UpgradeRequired,
    }
}

/// True when the host was fully configured by `version`
pub fn is_up_to_date(record: &InstanceRecord, version: &str) -> bool {
    lifecycle_state(record, version) == LifecycleState::UpToDate
}

/// True when the host was configured by another version and must be
/// deconfigured before being configured again
pub fn needs_upgrade(record: &InstanceRecord, version: &str) -> bool {
    lifecycle_state(record, version) == LifecycleState::UpgradeRequired
}

/// Status addresses a host can be reached and joined by.
///
/// An `InternalDNS` entry or an IPv4 `InternalIP` qualifies. IPv6 is not
/// supported by the Windows networking stack we configure, and external
/// addresses are never used to match inventory entries.
pub fn usable_addresses(addresses: &[NodeAddress]) -> impl Iterator<Item = &str> {
    addresses
        .iter()
        .filter(|a| match a.type_.as_str() {
            "InternalDNS" => !a.address.is_empty(),
            "InternalIP" => a.address.parse::<Ipv4Addr>().is_ok(),
            _ => false,
        })
        .map(|a| a.address.as_str())
}

/// One entry of the instance inventory ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceEntry {
    /// Host address, the ConfigMap key
    pub address: String,
    /// Remote user
    pub username: String,
    /// Hostname the host should be renamed to
    pub hostname: Option<String>,
}

/// Parse one `address -> "username=<user>[,hostname=<name>]"` inventory entry
pub fn parse_instance_entry(address: &str, value: &str) -> Result<InstanceEntry> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::input("instance address cannot be empty"));
    }

    let mut username = None;
    let mut hostname = None;
    for pair in value.split(',') {
        let Some((key, val)) = pair.split_once('=') else {
            return Err(Error::input_for_field(
                address,
                format!("expected value of the form username=<user>[,hostname=<name>], got {value:?}"),
            ));
        };
        let slot = match key.trim() {
            "username" => &mut username,
            "hostname" => &mut hostname,
            other => {
                return Err(Error::input_for_field(
                    address,
                    format!("unknown inventory key {other:?}"),
                ))
            }
        };
        if slot.replace(val.trim().to_string()).is_some() {
            return Err(Error::input_for_field(
                address,
                format!("inventory key {:?} given twice", key.trim()),
            ));
        }
    }

    let username = username.unwrap_or_default();
    if username.is_empty() {
        return Err(Error::input_for_field(address, "username cannot be empty"));
    }
    Ok(InstanceEntry {
        address: address.to_string(),
        username,
        hostname: hostname.filter(|h| !h.is_empty()),
    })
}

/// Parse every inventory entry; malformed entries are returned as errors
/// alongside the valid ones
pub fn parse_instance_entries(data: &BTreeMap<String, String>) -> Vec<Result<InstanceEntry>> {
    data.iter()
        .map(|(address, value)| parse_instance_entry(address, value))
        .collect()
}

/// Join inventory entries to the Windows Nodes that report their address
pub fn build_records(entries: Vec<InstanceEntry>, nodes: &[Node]) -> Vec<InstanceRecord> {
    entries
        .into_iter()
        .map(|entry| {
            let node = nodes.iter().find(|node| node_has_address(node, &entry.address));
            let mut record = InstanceRecord::new(entry.address, entry.username);
            if let Some(hostname) = entry.hostname {
                record = record.with_desired_hostname(hostname);
            }
            match node {
                Some(node) => record.with_node(NodeRef::from_node(node.clone())),
                None => record,
            }
        })
        .collect()
}

/// Whether one of the Node's usable addresses equals `address`
pub fn node_has_address(node: &Node, address: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .is_some_and(|addrs| usable_addresses(addrs).any(|a| a == address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use kube::api::ObjectMeta;

    const VERSION: &str = "0.4.0";

    fn node(name: &str, version: Option<&str>, addresses: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: version.map(|v| {
                    BTreeMap::from([(VERSION_ANNOTATION.to_string(), v.to_string())])
                }),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn record(version: Option<Option<&str>>) -> InstanceRecord {
        let record = InstanceRecord::new("10.0.0.5", "Administrator");
        match version {
            None => record,
            Some(v) => record.with_node(NodeRef::from_node(node("win-1", v, &[]))),
        }
    }

    #[test]
    fn test_state_table() {
        assert_eq!(lifecycle_state(&record(None), VERSION), LifecycleState::NotJoined);
        assert_eq!(
            lifecycle_state(&record(Some(None)), VERSION),
            LifecycleState::PartiallyConfigured
        );
        assert_eq!(
            lifecycle_state(&record(Some(Some(VERSION))), VERSION),
            LifecycleState::UpToDate
        );
        assert_eq!(
            lifecycle_state(&record(Some(Some("0.3.0"))), VERSION),
            LifecycleState::UpgradeRequired
        );
    }

    #[test]
    fn test_predicates_are_exclusive() {
        for version in [None, Some(None), Some(Some(VERSION)), Some(Some("0.3.0"))] {
            let r = record(version);
            let up_to_date = is_up_to_date(&r, VERSION);
            let upgrade = needs_upgrade(&r, VERSION);
            let first_time = lifecycle_state(&r, VERSION).needs_configuration();
            assert_eq!(
                [up_to_date, upgrade, first_time].iter().filter(|b| **b).count(),
                1,
                "exactly one path applies for {version:?}"
            );
        }
    }

    #[test]
    fn test_not_joined_is_never_up_to_date_or_upgrade() {
        let r = record(None);
        assert!(!is_up_to_date(&r, VERSION));
        assert!(!needs_upgrade(&r, VERSION));
    }

    #[test]
    fn test_node_without_snapshot_is_partially_configured() {
        let r = InstanceRecord::new("10.0.0.5", "Administrator").with_node(NodeRef::named("win-1"));
        assert_eq!(
            lifecycle_state(&r, VERSION),
            LifecycleState::PartiallyConfigured
        );
    }

    #[test]
    fn test_empty_desired_hostname_is_no_request() {
        let r = InstanceRecord::new("10.0.0.5", "Administrator").with_desired_hostname("");
        assert!(r.desired_hostname.is_none());
        let r = r.with_desired_hostname("win-a");
        assert_eq!(r.desired_hostname.as_deref(), Some("win-a"));
    }

    #[test]
    fn test_usable_addresses() {
        let addr = |t: &str, a: &str| NodeAddress {
            type_: t.to_string(),
            address: a.to_string(),
        };
        let usable = |addrs: &[NodeAddress]| usable_addresses(addrs).map(String::from).collect::<Vec<_>>();

        assert!(usable(&[]).is_empty());
        assert!(usable(&[NodeAddress::default()]).is_empty());
        assert!(usable(&[addr("InternalIP", "::1")]).is_empty());
        assert!(usable(&[addr("InternalDNS", "")]).is_empty());
        assert!(usable(&[addr("ExternalIP", "1.2.3.4"), addr("Hostname", "win-1")]).is_empty());
        assert_eq!(usable(&[addr("InternalIP", "127.0.0.1")]), vec!["127.0.0.1"]);
        assert_eq!(
            usable(&[
                addr("InternalDNS", "localhost"),
                addr("InternalIP", "fe80::1"),
                addr("InternalIP", "127.0.0.1"),
            ]),
            vec!["localhost", "127.0.0.1"]
        );
    }

    #[test]
    fn test_parse_instance_entries() {
        let data = BTreeMap::from([
            ("10.0.0.5".to_string(), "username=Administrator".to_string()),
            ("win-b.example.com".to_string(), " username = core ".to_string()),
            ("10.0.0.7".to_string(), "user=Administrator".to_string()),
            ("10.0.0.8".to_string(), "username=".to_string()),
        ]);

        let parsed = parse_instance_entries(&data);
        let ok: Vec<_> = parsed.iter().filter_map(|r| r.as_ref().ok()).collect();
        let errors: Vec<_> = parsed.iter().filter_map(|r| r.as_ref().err()).collect();

        assert_eq!(ok.len(), 2);
        assert!(ok.contains(&&InstanceEntry {
            address: "win-b.example.com".to_string(),
            username: "core".to_string(),
            hostname: None,
        }));
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, Error::Input { .. })));
    }

    #[test]
    fn test_parse_entry_with_hostname() {
        let entry =
            parse_instance_entry("10.0.0.5", "username=Administrator, hostname=win-a").expect("entry");
        assert_eq!(entry.username, "Administrator");
        assert_eq!(entry.hostname.as_deref(), Some("win-a"));

        let entry = parse_instance_entry("10.0.0.5", "hostname=,username=core").expect("entry");
        assert_eq!(entry.hostname, None);

        for bad in [
            "hostname=win-a",
            "username=core,domain=corp",
            "username=core,hostname=a,hostname=b",
            "username=core,",
        ] {
            assert!(
                matches!(parse_instance_entry("10.0.0.5", bad), Err(Error::Input { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    fn entry(address: &str, hostname: Option<&str>) -> InstanceEntry {
        InstanceEntry {
            address: address.to_string(),
            username: "Administrator".to_string(),
            hostname: hostname.map(String::from),
        }
    }

    #[test]
    fn test_build_records_joins_by_address() {
        let nodes = vec![
            node("win-1", Some(VERSION), &[("InternalIP", "10.0.0.5")]),
            node("win-2", None, &[("InternalIP", "10.0.0.9")]),
        ];
        let entries = vec![entry("10.0.0.5", None), entry("10.0.0.6", Some("win-b"))];

        let records = build_records(entries, &nodes);

        assert_eq!(records[0].node_name(), Some("win-1"));
        assert!(is_up_to_date(&records[0], VERSION));
        assert!(records[0].desired_hostname.is_none());
        assert!(records[1].node.is_none());
        assert_eq!(lifecycle_state(&records[1], VERSION), LifecycleState::NotJoined);
        assert_eq!(records[1].desired_hostname.as_deref(), Some("win-b"));
    }

    #[test]
    fn test_external_and_ipv6_addresses_do_not_join() {
        let nodes = vec![
            node("win-ext", Some(VERSION), &[("ExternalIP", "203.0.113.7")]),
            node("win-v6", Some(VERSION), &[("InternalIP", "fd00::5")]),
            node("win-dns", Some(VERSION), &[("InternalDNS", "win-c.corp")]),
        ];
        let entries = vec![
            entry("203.0.113.7", None),
            entry("fd00::5", None),
            entry("win-c.corp", None),
        ];

        let records = build_records(entries, &nodes);

        assert!(records[0].node.is_none());
        assert!(records[1].node.is_none());
        assert_eq!(records[2].node_name(), Some("win-dns"));
    }
}
