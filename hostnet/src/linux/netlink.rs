//! Route-table reads over rtnetlink, behind a blocking facade.
//!
//! The reader owns a private current-thread tokio runtime; callers stay
//! synchronous. Route selection mirrors the kernel: longest prefix first,
//! then lowest metric.

use std::ffi::CString;
use std::net::IpAddr;

use anyhow::{Context as _, Result};
use futures::TryStreamExt as _;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::{Handle, RouteMessageBuilder};

use crate::Route;

const RT_TABLE_MAIN: u32 = 254;

pub struct RouteReader {
    runtime: tokio::runtime::Runtime,
    handle: Handle,
}

impl RouteReader {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .context("Failed to build netlink runtime")?;

        let _guard = runtime.enter();
        let (connection, handle, _) =
            rtnetlink::new_connection().context("Failed to create netlink connection")?;
        runtime.spawn(connection);

        Ok(Self { runtime, handle })
    }

    /// The route the kernel would pick for `dest`, or `None` when nothing
    /// matches.
    pub fn best_route(&self, dest: IpAddr) -> Result<Option<Route>> {
        self.runtime.block_on(async {
            let routes = list_routes(&self.handle).await?;

            let Some(message) = select_best(&routes, dest) else {
                return Ok(None);
            };

            let if_index =
                iface_index_from_message(message).context("Best route has no output interface")?;
            let if_name = link_name(&self.handle, if_index).await?;

            Ok(Some(Route {
                gateway: gateway_from_message(message),
                if_name,
                if_index,
                metric: metric_from_message(message),
            }))
        })
    }
}

async fn list_routes(handle: &Handle) -> Result<Vec<RouteMessage>> {
    let all_routes = handle
        .route()
        .get(RouteMessageBuilder::<IpAddr>::new().build())
        .execute()
        .try_collect::<Vec<_>>()
        .await
        .context("Failed to get routes")?;

    Ok(all_routes)
}

async fn link_name(handle: &Handle, index: u32) -> Result<String> {
    let message = handle
        .link()
        .get()
        .match_index(index)
        .execute()
        .try_next()
        .await?
        .with_context(|| format!("No link with index {index}"))?;

    message
        .attributes
        .into_iter()
        .find_map(|a| match a {
            LinkAttribute::IfName(name) => Some(name),
            _ => None,
        })
        .with_context(|| format!("Link {index} has no name"))
}

/// Kernel route selection over a main-table dump: longest matching prefix
/// wins, metric breaks ties.
pub(crate) fn select_best(routes: &[RouteMessage], dest: IpAddr) -> Option<&RouteMessage> {
    routes
        .iter()
        .filter(|m| table_id_from_message(m) == RT_TABLE_MAIN)
        .filter(|m| iface_index_from_message(m).is_some())
        .filter(|m| route_contains(m, dest))
        .max_by(|a, b| {
            let by_prefix = a
                .header
                .destination_prefix_length
                .cmp(&b.header.destination_prefix_length);

            // `max_by` keeps the later element on ties; flip the metric so
            // the *lowest* metric wins.
            by_prefix.then_with(|| metric_from_message(b).cmp(&metric_from_message(a)))
        })
}

fn route_contains(message: &RouteMessage, dest: IpAddr) -> bool {
    let prefix_len = message.header.destination_prefix_length;

    let destination = message.attributes.iter().find_map(|a| match a {
        RouteAttribute::Destination(RouteAddress::Inet(ipv4)) => Some(IpAddr::V4(*ipv4)),
        RouteAttribute::Destination(RouteAddress::Inet6(ipv6)) => Some(IpAddr::V6(*ipv6)),
        _ => None,
    });

    match (destination, dest) {
        // A default route matches everything of its family.
        (None, IpAddr::V4(_)) => {
            prefix_len == 0 && message.header.address_family == AddressFamily::Inet
        }
        (None, IpAddr::V6(_)) => {
            prefix_len == 0 && message.header.address_family == AddressFamily::Inet6
        }
        (Some(IpAddr::V4(network)), IpAddr::V4(dest)) => {
            ip_network::Ipv4Network::new_truncate(network, prefix_len)
                .map(|n| n.contains(dest))
                .unwrap_or(false)
        }
        (Some(IpAddr::V6(network)), IpAddr::V6(dest)) => {
            ip_network::Ipv6Network::new_truncate(network, prefix_len)
                .map(|n| n.contains(dest))
                .unwrap_or(false)
        }
        (Some(_), _) => false,
    }
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
pub(crate) fn table_id_from_message(message: &RouteMessage) -> u32 {
    message
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(message.header.table as u32)
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
pub(crate) fn iface_index_from_message(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|a| match a {
        RouteAttribute::Oif(idx) => Some(*idx),
        _ => None,
    })
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
pub(crate) fn gateway_from_message(message: &RouteMessage) -> Option<IpAddr> {
    message.attributes.iter().find_map(|a| match a {
        RouteAttribute::Gateway(RouteAddress::Inet(ipv4)) => Some(IpAddr::V4(*ipv4)),
        RouteAttribute::Gateway(RouteAddress::Inet6(ipv6)) => Some(IpAddr::V6(*ipv6)),
        _ => None,
    })
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "We don't want to match all attributes."
)]
pub(crate) fn metric_from_message(message: &RouteMessage) -> u32 {
    message
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Priority(metric) => Some(*metric),
            _ => None,
        })
        .unwrap_or(0)
}

/// Parses `ip route get <dest>` output, e.g.
/// `198.51.100.10 via 192.0.2.1 dev eth0 src 192.0.2.55 uid 0`.
pub(crate) fn parse_route_get(output: &str, _dest: IpAddr) -> Option<Route> {
    let line = output.lines().next()?;
    let tokens = line.split_whitespace().collect::<Vec<_>>();

    let mut gateway = None;
    let mut if_name = None;
    let mut metric = 0;

    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        match *token {
            "via" => gateway = iter.next().and_then(|g| g.parse::<IpAddr>().ok()),
            "dev" => if_name = iter.next().map(|d| (*d).to_owned()),
            "metric" => metric = iter.next().and_then(|m| m.parse().ok()).unwrap_or(0),
            _ => {}
        }
    }

    let if_name = if_name?;

    Some(Route {
        gateway,
        if_index: if_index_for(&if_name),
        if_name,
        metric,
    })
}

fn if_index_for(name: &str) -> u32 {
    let Ok(name) = CString::new(name) else {
        return 0;
    };

    // Safety: `name` is a valid NUL-terminated string.
    unsafe { libc::if_nametoindex(name.as_ptr()) }
}
