//! Host-network programming on Windows through the IP Helper API.
//!
//! Everything goes through kernel handles keyed by the adapter LUID; there
//! is no shell-out. Error codes follow the Win32 result-code scheme, see
//! <https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-erref>.

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use ip_network::IpNetwork;

use windows::Win32::Foundation::WIN32_ERROR;
use windows::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceAliasToLuid, ConvertInterfaceLuidToGuid, ConvertInterfaceLuidToIndex,
    CreateIpForwardEntry2, CreateUnicastIpAddressEntry, DNS_INTERFACE_SETTINGS,
    DNS_INTERFACE_SETTINGS_VERSION1, DNS_SETTING_NAMESERVER, DeleteIpForwardEntry2,
    DeleteUnicastIpAddressEntry, FreeMibTable, GetIpForwardTable2, GetIpInterfaceEntry,
    InitializeIpForwardEntry, InitializeUnicastIpAddressEntry, MIB_IPFORWARD_ROW2,
    MIB_IPFORWARD_TABLE2, MIB_IPINTERFACE_ROW, MIB_UNICASTIPADDRESS_ROW, SetInterfaceDnsSettings,
    SetIpInterfaceEntry,
};
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows::Win32::Networking::WinSock::{ADDRESS_FAMILY, AF_INET, AF_INET6, AF_UNSPEC};
use windows::core::{GUID, PCWSTR, PWSTR};

use crate::{Error, Family, HostNetwork, Result, Route};

/// Win32 error code for objects that don't exist (like network adapters).
const NOT_FOUND: windows::core::HRESULT = windows::core::HRESULT::from_win32(0x0490);
/// Win32 error code for objects that already exist (like routing table
/// entries).
const OBJECT_EXISTS: windows::core::HRESULT = windows::core::HRESULT::from_win32(0x1392);
/// Win32 error code for unsupported operations (like setting an IPv6
/// address without an IPv6 stack).
const NOT_SUPPORTED: windows::core::HRESULT = windows::core::HRESULT::from_win32(0x0032);

#[link(name = "dnsapi")]
unsafe extern "system" {
    /// Undocumented but stable since XP; what `ipconfig /flushdns` calls.
    fn DnsFlushResolverCache();
}

#[derive(Debug, Default)]
pub struct WindowsNetwork;

impl WindowsNetwork {
    pub fn new() -> Self {
        Self
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn luid_for(if_name: &str) -> Result<NET_LUID_LH> {
    let name = wide(if_name);
    let mut luid = NET_LUID_LH::default();

    // Safety: `name` is NUL-terminated and `luid` outlives the call.
    unsafe { ConvertInterfaceAliasToLuid(PCWSTR(name.as_ptr()), &mut luid) }
        .ok()
        .map_err(|e| Error::host_state("resolve interface", format!("`{if_name}`: {e}")))?;

    Ok(luid)
}

fn index_for(luid: &NET_LUID_LH) -> Result<u32> {
    let mut index = 0u32;

    // Safety: Both pointers are valid for the duration of the call.
    unsafe { ConvertInterfaceLuidToIndex(luid, &mut index) }
        .ok()
        .map_err(|e| Error::host_state("resolve interface index", e))?;

    Ok(index)
}

fn address_row(luid: NET_LUID_LH, addr: IpAddr, prefix_len: u8) -> MIB_UNICASTIPADDRESS_ROW {
    // Safety: The docs only require `InitializeUnicastIpAddressEntry` before
    // use, which we call on the zeroed row.
    let mut row = unsafe {
        let mut row: MIB_UNICASTIPADDRESS_ROW = std::mem::zeroed();
        InitializeUnicastIpAddressEntry(&mut row);
        row
    };

    row.InterfaceLuid = luid;
    row.ValidLifetime = 0xffff_ffff; // Infinite
    row.OnLinkPrefixLength = prefix_len;

    match addr {
        IpAddr::V4(ipv4) => {
            row.Address.si_family = AF_INET;
            row.Address.Ipv4 = SocketAddrV4::new(ipv4, 0).into();
        }
        IpAddr::V6(ipv6) => {
            row.Address.si_family = AF_INET6;
            row.Address.Ipv6 = SocketAddrV6::new(ipv6, 0, 0, 0).into();
        }
    }

    row
}

fn forward_entry(route: IpNetwork, iface_idx: u32, gateway: Option<IpAddr>, metric: u32) -> MIB_IPFORWARD_ROW2 {
    let mut row = MIB_IPFORWARD_ROW2::default();
    // Safety: Only sets defaults on the row we own.
    unsafe { InitializeIpForwardEntry(&mut row) };

    let prefix = &mut row.DestinationPrefix;
    match route {
        IpNetwork::V4(x) => {
            prefix.PrefixLength = x.netmask();
            prefix.Prefix.Ipv4 = SocketAddrV4::new(x.network_address(), 0).into();
        }
        IpNetwork::V6(x) => {
            prefix.PrefixLength = x.netmask();
            prefix.Prefix.Ipv6 = SocketAddrV6::new(x.network_address(), 0, 0, 0).into();
        }
    }

    match gateway {
        Some(IpAddr::V4(gw)) => row.NextHop.Ipv4 = SocketAddrV4::new(gw, 0).into(),
        Some(IpAddr::V6(gw)) => row.NextHop.Ipv6 = SocketAddrV6::new(gw, 0, 0, 0).into(),
        None => {}
    }

    row.InterfaceIndex = iface_idx;
    row.Metric = metric;

    row
}

fn add_forward_entry(entry: &MIB_IPFORWARD_ROW2, op: &str) -> Result<()> {
    // Safety: Windows only reads the row during the call.
    let Err(e) = unsafe { CreateIpForwardEntry2(entry) }.ok() else {
        return Ok(());
    };

    // Re-adding the same route is the desired end state.
    if e.code() == OBJECT_EXISTS {
        return Ok(());
    }

    Err(Error::host_state(op, e))
}

fn delete_forward_entry(entry: &MIB_IPFORWARD_ROW2, op: &str) -> Result<()> {
    // Safety: Windows only reads the row during the call.
    let Err(e) = unsafe { DeleteIpForwardEntry2(entry) }.ok() else {
        return Ok(());
    };

    if e.code() == NOT_FOUND {
        return Ok(());
    }

    Err(Error::host_state(op, e))
}

/// The interface metric, folded into the effective route metric the way the
/// kernel does it.
fn interface_metric(luid: NET_LUID_LH, family: ADDRESS_FAMILY) -> u32 {
    let mut row = MIB_IPINTERFACE_ROW {
        Family: family,
        InterfaceLuid: luid,
        ..Default::default()
    };

    // Safety: The row is initialised with the lookup key.
    match unsafe { GetIpInterfaceEntry(&mut row) }.ok() {
        Ok(()) => row.Metric,
        Err(_) => 0,
    }
}

struct ForwardTable {
    table: *mut MIB_IPFORWARD_TABLE2,
}

impl ForwardTable {
    fn load() -> Result<Self> {
        let mut table = std::ptr::null_mut::<MIB_IPFORWARD_TABLE2>();

        // Safety: `table` is a valid out-pointer.
        unsafe { GetIpForwardTable2(AF_UNSPEC, &mut table) }
            .ok()
            .map_err(|e| Error::host_state("read forwarding table", e))?;

        Ok(Self { table })
    }

    fn rows(&self) -> &[MIB_IPFORWARD_ROW2] {
        // Safety: Windows guarantees `NumEntries` rows in `Table`.
        unsafe {
            let table = &*self.table;
            std::slice::from_raw_parts(table.Table.as_ptr(), table.NumEntries as usize)
        }
    }
}

impl Drop for ForwardTable {
    fn drop(&mut self) {
        // Safety: The table was allocated by `GetIpForwardTable2`.
        unsafe { FreeMibTable(self.table as *const _) };
    }
}

fn row_destination(row: &MIB_IPFORWARD_ROW2) -> Option<IpNetwork> {
    let prefix = &row.DestinationPrefix;
    let prefix_len = prefix.PrefixLength;

    // Safety: The union member is selected by `si_family`.
    unsafe {
        let family = prefix.Prefix.si_family;

        if family == AF_INET {
            let addr = std::net::Ipv4Addr::from(prefix.Prefix.Ipv4.sin_addr);
            ip_network::Ipv4Network::new_truncate(addr, prefix_len)
                .ok()
                .map(IpNetwork::V4)
        } else if family == AF_INET6 {
            let addr = std::net::Ipv6Addr::from(prefix.Prefix.Ipv6.sin6_addr);
            ip_network::Ipv6Network::new_truncate(addr, prefix_len)
                .ok()
                .map(IpNetwork::V6)
        } else {
            None
        }
    }
}

fn row_next_hop(row: &MIB_IPFORWARD_ROW2) -> Option<IpAddr> {
    // Safety: The union member is selected by `si_family`.
    unsafe {
        let family = row.NextHop.si_family;

        if family == AF_INET {
            let addr = std::net::Ipv4Addr::from(row.NextHop.Ipv4.sin_addr);
            (!addr.is_unspecified()).then_some(IpAddr::V4(addr))
        } else if family == AF_INET6 {
            let addr = std::net::Ipv6Addr::from(row.NextHop.Ipv6.sin6_addr);
            (!addr.is_unspecified()).then_some(IpAddr::V6(addr))
        } else {
            None
        }
    }
}

fn network_contains(network: IpNetwork, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpNetwork::V4(network), IpAddr::V4(addr)) => network.contains(addr),
        (IpNetwork::V6(network), IpAddr::V6(addr)) => network.contains(addr),
        (IpNetwork::V4(_), IpAddr::V6(_)) | (IpNetwork::V6(_), IpAddr::V4(_)) => false,
    }
}

fn alias_for(luid: &NET_LUID_LH) -> String {
    use windows::Win32::NetworkManagement::IpHelper::ConvertInterfaceLuidToAlias;

    let mut buffer = [0u16; 257]; // IF_MAX_STRING_SIZE + 1

    // Safety: The buffer is large enough per the API contract.
    match unsafe { ConvertInterfaceLuidToAlias(luid, &mut buffer) }.ok() {
        Ok(()) => {
            let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
            String::from_utf16_lossy(&buffer[..len])
        }
        Err(_) => String::new(),
    }
}

impl HostNetwork for WindowsNetwork {
    fn assign_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let luid = luid_for(if_name)?;
        let row = address_row(luid, addr, prefix_len);

        // Safety: The row is fully initialised.
        match unsafe { CreateUnicastIpAddressEntry(&row) }.ok() {
            Ok(()) => Ok(()),
            Err(e) if e.code() == OBJECT_EXISTS => Ok(()),
            Err(e) if e.code() == NOT_SUPPORTED || e.code() == NOT_FOUND => Err(
                Error::host_state("assign address", format!("IP stack disabled? {e}")),
            ),
            Err(e) => Err(Error::host_state("assign address", e)),
        }
    }

    fn delete_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let luid = luid_for(if_name)?;
        let row = address_row(luid, addr, prefix_len);

        // Safety: The row is fully initialised.
        match unsafe { DeleteUnicastIpAddressEntry(&row) }.ok() {
            Ok(()) => Ok(()),
            Err(e) if e.code() == NOT_FOUND => Ok(()),
            Err(e) => Err(Error::host_state("delete address", e)),
        }
    }

    fn set_mtu(&self, if_name: &str, family: Family, mtu: u32) -> Result<()> {
        if mtu < family.min_mtu() {
            return Err(Error::MtuBelowMinimum {
                mtu,
                family,
                min: family.min_mtu(),
            });
        }

        let luid = luid_for(if_name)?;
        let win_family = match family {
            Family::V4 => AF_INET,
            Family::V6 => AF_INET6,
        };

        let mut row = MIB_IPINTERFACE_ROW {
            Family: win_family,
            InterfaceLuid: luid,
            ..Default::default()
        };

        // Safety: The row is initialised with the lookup key.
        if let Err(e) = unsafe { GetIpInterfaceEntry(&mut row) }.ok() {
            if family == Family::V6 && e.code() == NOT_FOUND {
                tracing::debug!("Couldn't set IPv6 MTU, maybe IPv6 is disabled.");
                return Ok(());
            }
            return Err(Error::host_state("set MTU", e));
        }

        // https://stackoverflow.com/questions/54857292/setipinterfaceentry-returns-error-invalid-parameter
        row.SitePrefixLength = 0;
        row.NlMtu = mtu;

        // Safety: The row came from `GetIpInterfaceEntry`.
        unsafe { SetIpInterfaceEntry(&mut row) }
            .ok()
            .map_err(|e| Error::host_state("set MTU", e))
    }

    fn set_interface_up(&self, _if_name: &str) -> Result<()> {
        // Wintun adapters come up with the session; nothing to do.
        Ok(())
    }

    fn delete_interface(&self, if_name: &str) -> Result<()> {
        // The adapter is removed when its owner drops it.
        tracing::debug!(%if_name, "Adapter teardown is owned by the device handle");
        Ok(())
    }

    fn add_route_on_link(&self, dest: IpNetwork, if_name: &str, metric: u32) -> Result<()> {
        let index = index_for(&luid_for(if_name)?)?;
        let entry = forward_entry(dest, index, None, metric);

        add_forward_entry(&entry, "add on-link route")
    }

    fn add_route_via_gateway(
        &self,
        dest: IpNetwork,
        if_name: &str,
        gateway: IpAddr,
        metric: u32,
    ) -> Result<()> {
        let index = index_for(&luid_for(if_name)?)?;
        let entry = forward_entry(dest, index, Some(gateway), metric);

        add_forward_entry(&entry, "add route via gateway")
    }

    fn delete_route(&self, dest: IpNetwork) -> Result<()> {
        // Without an interface we have to find the row ourselves.
        let table = ForwardTable::load()?;

        for row in table.rows() {
            if row_destination(row) == Some(dest) {
                delete_forward_entry(row, "delete route")?;
            }
        }

        Ok(())
    }

    fn delete_route_on_interface(&self, dest: IpNetwork, if_name: &str) -> Result<()> {
        let index = index_for(&luid_for(if_name)?)?;
        let entry = forward_entry(dest, index, None, 0);

        delete_forward_entry(&entry, "delete route")
    }

    fn add_default_split_routes(&self, if_name: &str, family: Family, metric: u32) -> Result<()> {
        for half in family.split_default() {
            self.add_route_on_link(half, if_name, metric)?;
        }

        Ok(())
    }

    fn delete_default_split_routes(&self, if_name: &str, family: Family) -> Result<()> {
        for half in family.split_default() {
            self.delete_route_on_interface(half, if_name)?;
        }

        Ok(())
    }

    fn best_route(&self, dest: IpAddr) -> Result<Route> {
        let table = ForwardTable::load()?;

        let best = table
            .rows()
            .iter()
            .filter_map(|row| {
                let network = row_destination(row)?;
                network_contains(network, dest).then_some((row, network.netmask()))
            })
            .max_by(|(a, a_len), (b, b_len)| {
                let family = match dest {
                    IpAddr::V4(_) => AF_INET,
                    IpAddr::V6(_) => AF_INET6,
                };

                let a_metric = a.Metric + interface_metric(a.InterfaceLuid, family);
                let b_metric = b.Metric + interface_metric(b.InterfaceLuid, family);

                // Longest prefix first, then the *lowest* effective metric.
                a_len.cmp(b_len).then_with(|| b_metric.cmp(&a_metric))
            });

        let Some((row, _)) = best else {
            return Err(Error::NoRoute(dest));
        };

        let family = match dest {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        };

        Ok(Route {
            gateway: row_next_hop(row),
            if_name: alias_for(&row.InterfaceLuid),
            if_index: row.InterfaceIndex,
            metric: row.Metric + interface_metric(row.InterfaceLuid, family),
        })
    }

    fn set_dns(&self, if_name: &str, resolvers: &[IpAddr]) -> Result<()> {
        let luid = luid_for(if_name)?;

        let mut guid = GUID::default();
        // Safety: Both pointers are valid for the duration of the call.
        unsafe { ConvertInterfaceLuidToGuid(&luid, &mut guid) }
            .ok()
            .map_err(|e| Error::host_state("resolve interface GUID", e))?;

        // An empty server list clears the override so DHCP values apply.
        let servers = resolvers
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut servers = wide(&servers);

        let settings = DNS_INTERFACE_SETTINGS {
            Version: DNS_INTERFACE_SETTINGS_VERSION1,
            Flags: u64::from(DNS_SETTING_NAMESERVER),
            NameServer: PWSTR(servers.as_mut_ptr()),
            ..Default::default()
        };

        // Safety: `settings` and the server string live across the call.
        let status: WIN32_ERROR = unsafe { SetInterfaceDnsSettings(guid, &settings) };
        status
            .ok()
            .map_err(|e| Error::host_state("set DNS", e))?;

        Ok(())
    }

    fn flush_dns(&self) -> Result<()> {
        // Safety: Takes no arguments and touches no caller memory.
        unsafe { DnsFlushResolverCache() };

        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        Err(Error::Unsupported("IP forwarding control"))
    }

    fn enable_masquerade(&self, _ext_if: &str, _family: Family, _best_effort: bool) -> Result<()> {
        Err(Error::Unsupported("masquerade"))
    }

    fn disable_masquerade(&self, _ext_if: &str, _family: Family, _best_effort: bool) -> Result<()> {
        Err(Error::Unsupported("masquerade"))
    }

    fn accept_forward(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn delete_accept_forward(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn accept_forward_established(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn delete_accept_forward_established(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn install_mss_clamp(&self, _tun_name: &str) -> Result<()> {
        // MSS is handled by the TCP stack once the tunnel MTU is set.
        tracing::debug!("MSS clamping is not available on Windows, skipping");
        Ok(())
    }

    fn remove_mss_clamp(&self, _tun_name: &str) -> Result<()> {
        Ok(())
    }
}
