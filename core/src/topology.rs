//! Cluster topology: which node ids live on which host
//!
//! Node ids are assigned by enumerating the resolved host list in order, so
//! they are contiguous, start at 0 and are unique cluster-wide. The topology
//! is derived once per run and never changes afterwards.

use std::collections::BTreeSet;
use std::net::{IpAddr, ToSocketAddrs};

use crate::config::HostSpec;
use crate::error::{MechanicError, Result};

/// Resolves host names to IP addresses
pub trait HostResolver: Send + Sync {
    /// Resolve a host name (or IP literal) to an IP address
    fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver backed by the operating system
///
/// IPv4 addresses are preferred when a name resolves to several addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|e| MechanicError::setup(format!("cannot resolve host [{host}]: {e}")))?
            .map(|addr| addr.ip())
            .collect();
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| MechanicError::setup(format!("host [{host}] resolved to no address")))
    }
}

/// A resolved (IP, port) pair
pub type IpPort = (IpAddr, u16);

/// Nodes that share one (IP, port) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostGroup {
    /// Host IP
    pub ip: IpAddr,
    /// HTTP port
    pub port: u16,
    /// Node ids on this host, ascending
    pub node_ids: Vec<usize>,
}

impl HostGroup {
    /// Whether the host is this machine
    pub fn is_local(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// Resolve configured hosts to (IP, port) pairs
///
/// Hosts managed by the mechanic may only carry a host name and a port.
pub fn to_ip_port(hosts: &[HostSpec], resolver: &dyn HostResolver) -> Result<Vec<IpPort>> {
    hosts
        .iter()
        .map(|host| {
            if !host.options.is_empty() {
                return Err(MechanicError::setup(
                    "When specifying nodes to be managed by the mechanic you can only supply \
                     hostname:port pairs (e.g. 'localhost:9200'), any additional options cannot \
                     be supported.",
                ));
            }
            Ok((resolver.resolve(&host.host)?, host.port))
        })
        .collect()
}

/// Distinct IPs of all nodes, ascending
pub fn extract_all_node_ips(pairs: &[IpPort]) -> Vec<IpAddr> {
    pairs
        .iter()
        .map(|(ip, _)| *ip)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Group node ids by (IP, port), keeping first-seen order of the groups
pub fn nodes_by_host(pairs: &[IpPort]) -> Vec<HostGroup> {
    let mut groups: Vec<HostGroup> = Vec::new();
    for (node_id, (ip, port)) in pairs.iter().enumerate() {
        match groups.iter_mut().find(|g| g.ip == *ip && g.port == *port) {
            Some(group) => group.node_ids.push(node_id),
            None => groups.push(HostGroup {
                ip: *ip,
                port: *port,
                node_ids: vec![node_id],
            }),
        }
    }
    groups
}

/// Resolved topology of a self-managed cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Distinct IPs of all nodes
    pub all_node_ips: Vec<IpAddr>,
    /// Host groups in first-seen order
    pub groups: Vec<HostGroup>,
}

impl Topology {
    /// Resolve a topology from configured hosts
    pub fn resolve(hosts: &[HostSpec], resolver: &dyn HostResolver) -> Result<Self> {
        let pairs = to_ip_port(hosts, resolver)?;
        Ok(Self {
            all_node_ips: extract_all_node_ips(&pairs),
            groups: nodes_by_host(&pairs),
        })
    }

    /// Total number of nodes
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|g| g.node_ids.len()).sum()
    }
}
