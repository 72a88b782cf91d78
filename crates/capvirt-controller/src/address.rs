//! Static node address allocation
//!
//! A VirtinkCluster may declare a pool of addresses and a set of annotation
//! templates. Every machine whose annotations mention `$IP_ADDRESS` or
//! `$MAC_ADDRESS` gets one pool address and one generated MAC, recorded in
//! the cluster's `status.nodeAddresses` ledger. The cluster reconciler is the
//! only writer of the ledger; the machine reconciler reads its own entry and
//! renders the placeholders.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use kube::ResourceExt;
use rand::Rng;

use capvirt_common::crd::{AnnotationTemplate, NodeAddress, NodeAddressConfig, VirtinkMachine};
use capvirt_common::Error;

/// Placeholder replaced with the machine's pool address
pub const IP_ADDRESS_PLACEHOLDER: &str = "$IP_ADDRESS";
/// Placeholder replaced with the machine's generated MAC
pub const MAC_ADDRESS_PLACEHOLDER: &str = "$MAC_ADDRESS";

const KNOWN_PLACEHOLDERS: [&str; 2] = ["IP_ADDRESS", "MAC_ADDRESS"];

/// Largest number of host bits a single pool entry may expand to
const MAX_ENTRY_HOST_BITS: u32 = 16;

/// QEMU/KVM locally administered prefix
const MAC_PREFIX: &str = "52:54:00";

fn to_bits(ip: IpAddr) -> (u128, u32) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

fn from_bits(bits: u128, width: u32) -> IpAddr {
    if width == 32 {
        IpAddr::V4(Ipv4Addr::from(bits as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(bits))
    }
}

fn parse_ip(entry: &str, text: &str) -> Result<IpAddr, Error> {
    text.trim().parse().map_err(|_| {
        Error::validation_for_field(
            entry,
            "spec.nodeAddressConfig.addresses",
            format!("{text:?} is not an IP address"),
        )
    })
}

/// Addresses `start..=start + last_offset`
///
/// The size is checked through the offset so a range covering a whole
/// address family cannot overflow.
fn span(entry: &str, start: u128, last_offset: u128, width: u32) -> Result<Vec<IpAddr>, Error> {
    if last_offset >= 1u128 << MAX_ENTRY_HOST_BITS {
        return Err(Error::validation_for_field(
            entry,
            "spec.nodeAddressConfig.addresses",
            format!("entry is too large, at most {} addresses allowed", 1u32 << MAX_ENTRY_HOST_BITS),
        ));
    }
    Ok((0..=last_offset).map(|i| from_bits(start + i, width)).collect())
}

/// Expand one pool entry: a single address, an inclusive `first-last` range,
/// or a CIDR block including its network and broadcast addresses
pub fn parse_pool_entry(entry: &str) -> Result<Vec<IpAddr>, Error> {
    let entry = entry.trim();
    let invalid = |msg: String| {
        Error::validation_for_field(entry, "spec.nodeAddressConfig.addresses", msg)
    };

    if let Some((addr, prefix)) = entry.split_once('/') {
        let (bits, width) = to_bits(parse_ip(entry, addr)?);
        let prefix: u32 = prefix
            .trim()
            .parse()
            .map_err(|_| invalid(format!("invalid prefix length {prefix:?}")))?;
        if prefix > width {
            return Err(invalid(format!("prefix length {prefix} exceeds {width}")));
        }
        let host_bits = width - prefix;
        if host_bits > MAX_ENTRY_HOST_BITS {
            return Err(invalid(format!(
                "/{prefix} is too large, at most {} addresses allowed",
                1u32 << MAX_ENTRY_HOST_BITS
            )));
        }
        let size = 1u128 << host_bits;
        let network = bits & !(size - 1);
        return span(entry, network, size - 1, width);
    }

    if let Some((first, last)) = entry.split_once('-') {
        let (start, width) = to_bits(parse_ip(entry, first)?);
        let (end, end_width) = to_bits(parse_ip(entry, last)?);
        if width != end_width {
            return Err(invalid("range mixes IPv4 and IPv6".to_string()));
        }
        if end < start {
            return Err(invalid(format!("range end {last} precedes start {first}")));
        }
        return span(entry, start, end - start, width);
    }

    Ok(vec![parse_ip(entry, entry)?])
}

/// Expand every pool entry in declared order, dropping repeats
pub fn expand_pool(addresses: &[String]) -> Result<Vec<IpAddr>, Error> {
    let mut seen = BTreeSet::new();
    let mut pool = Vec::new();
    for entry in addresses {
        for ip in parse_pool_entry(entry)? {
            if seen.insert(ip) {
                pool.push(ip);
            }
        }
    }
    Ok(pool)
}

/// Random locally administered unicast MAC in lowercase colon notation
pub fn generate_mac<R: Rng + ?Sized>(rng: &mut R) -> String {
    let suffix: [u8; 3] = rng.gen();
    format!(
        "{MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
        suffix[0], suffix[1], suffix[2]
    )
}

/// Reject `$NAME` tokens other than the known placeholders
pub fn validate_template(value: &str) -> Result<(), Error> {
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let token_len = rest
            .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
            .unwrap_or(rest.len());
        let token = &rest[..token_len];
        if !token.is_empty() && !KNOWN_PLACEHOLDERS.contains(&token) {
            return Err(Error::invalid_template(
                value,
                format!("unknown placeholder ${token}, expected $IP_ADDRESS or $MAC_ADDRESS"),
            ));
        }
        rest = &rest[token_len..];
    }
    Ok(())
}

/// Whether a value still has a placeholder to render
pub fn has_placeholder(value: &str) -> bool {
    value.contains(IP_ADDRESS_PLACEHOLDER) || value.contains(MAC_ADDRESS_PLACEHOLDER)
}

/// Substitute both placeholders
pub fn render(value: &str, address: &NodeAddress) -> String {
    value
        .replace(IP_ADDRESS_PLACEHOLDER, &address.ip)
        .replace(MAC_ADDRESS_PLACEHOLDER, &address.mac)
}

/// Add cluster templates the annotations do not set yet
pub fn merge_templates(annotations: &mut BTreeMap<String, String>, templates: &[AnnotationTemplate]) {
    for template in templates {
        annotations
            .entry(template.name.clone())
            .or_insert_with(|| template.value.clone());
    }
}

/// Merge cluster templates into `annotations` and render every value
pub fn render_annotations(
    annotations: &mut BTreeMap<String, String>,
    templates: &[AnnotationTemplate],
    address: &NodeAddress,
) {
    merge_templates(annotations, templates);
    for value in annotations.values_mut() {
        if has_placeholder(value) {
            *value = render(value, address);
        }
    }
}

/// Whether a machine still waits for a pool address
///
/// True when its annotations, merged with the cluster templates, contain a
/// placeholder.
pub fn needs_address(machine: &VirtinkMachine, templates: &[AnnotationTemplate]) -> bool {
    let annotations = machine.annotations();
    annotations.values().any(|v| has_placeholder(v))
        || templates
            .iter()
            .any(|t| !annotations.contains_key(&t.name) && has_placeholder(&t.value))
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == ':'
}

/// Addresses written literally into any machine's annotations
///
/// Only whole tokens count: `10.0.0.50` is not a mention of `10.0.0.5`.
pub fn mentioned_addresses(machines: &[VirtinkMachine]) -> BTreeSet<IpAddr> {
    machines
        .iter()
        .flat_map(|m| m.annotations().values())
        .flat_map(|value| value.split(|c: char| !is_address_char(c)))
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Compute the ledger after this pass
///
/// Entries of machines that no longer exist are dropped. Machines that need
/// an address and have none are served in name order, each taking the first
/// pool address that is neither in the ledger nor written literally into any
/// machine's annotations. Existing entries are never moved.
pub fn allocate<R: Rng + ?Sized>(
    cluster: &str,
    config: &NodeAddressConfig,
    ledger: &[NodeAddress],
    machines: &[VirtinkMachine],
    rng: &mut R,
) -> Result<Vec<NodeAddress>, Error> {
    for template in &config.annotations {
        validate_template(&template.value)?;
    }
    let pool = expand_pool(&config.addresses)?;

    let names: BTreeSet<String> = machines.iter().map(|m| m.name_any()).collect();
    let mut seen = BTreeSet::new();
    let mut next: Vec<NodeAddress> = ledger
        .iter()
        .filter(|entry| names.contains(&entry.machine_name))
        .filter(|entry| seen.insert(entry.machine_name.clone()))
        .cloned()
        .collect();

    let assigned: BTreeSet<String> = next.iter().map(|entry| entry.ip.clone()).collect();
    let mentioned = mentioned_addresses(machines);

    let mut pending: Vec<&VirtinkMachine> = machines
        .iter()
        .filter(|m| m.metadata.deletion_timestamp.is_none())
        .filter(|m| !seen.contains(&m.name_any()))
        .filter(|m| needs_address(m, &config.annotations))
        .collect();
    pending.sort_by_key(|m| m.name_any());

    let mut free = pool
        .iter()
        .filter(|ip| !mentioned.contains(*ip))
        .map(IpAddr::to_string)
        .filter(|ip| !assigned.contains(ip));
    for (served, machine) in pending.iter().enumerate() {
        let Some(ip) = free.next() else {
            return Err(Error::AddressPoolExhausted {
                cluster: cluster.to_string(),
                pool_size: pool.len(),
                pending: pending.len() - served,
            });
        };
        next.push(NodeAddress {
            machine_name: machine.name_any(),
            ip,
            mac: generate_mac(rng),
        });
    }

    Ok(next)
}
