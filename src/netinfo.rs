use std::net::IpAddr;
use std::time::Duration;

use sysinfo::Networks;
use tracing::debug;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelAddresses {
    pub server_ip: Option<IpAddr>,
    pub assigned_ip: Option<IpAddr>,
    pub interface: Option<String>,
}

fn is_tunnel_line(line: &str) -> bool {
    line.contains("tun") || line.contains("tap")
}

/// Gateway of the first tun/tap route in `netstat -rn` output.
pub fn gateway_from_routes(output: &str) -> Option<IpAddr> {
    output
        .lines()
        .filter(|line| is_tunnel_line(line))
        .filter_map(|line| line.split_whitespace().nth(1))
        .find_map(|column| column.parse::<IpAddr>().ok())
}

/// Interface name and inet address of the first tun/tap block in `ifconfig` output.
pub fn tunnel_address_from_ifconfig(output: &str) -> Option<(String, IpAddr)> {
    let mut current: Option<String> = None;

    for line in output.lines() {
        let indented = line.starts_with([' ', '\t']);
        if !indented {
            current = line
                .split(|c: char| c == ':' || c.is_whitespace())
                .next()
                .filter(|name| is_tunnel_line(name))
                .map(str::to_string);
            continue;
        }

        let Some(iface) = &current else {
            continue;
        };

        let mut parts = line.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "inet"
                && let Some(addr) = parts.next()
            {
                let addr = addr.trim_start_matches("addr:");
                let addr = addr.split('/').next().unwrap_or(addr);
                if let Ok(ip) = addr.parse::<IpAddr>() {
                    return Some((iface.clone(), ip));
                }
            }
        }
    }

    None
}

async fn capture(program: &str, args: &[&str]) -> Option<String> {
    let run = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(COMMAND_TIMEOUT, run).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(e)) => {
            debug!("{} unavailable: {}", program, e);
            None
        }
        Err(_) => {
            debug!("{} timed out", program);
            None
        }
    }
}

/// Inspects the routing table and interfaces for an active tunnel.
pub async fn discover() -> TunnelAddresses {
    let mut found = TunnelAddresses::default();

    if let Some(routes) = capture("netstat", &["-rn"]).await {
        found.server_ip = gateway_from_routes(&routes);
    }

    if let Some(ifconfig) = capture("ifconfig", &[]).await
        && let Some((iface, ip)) = tunnel_address_from_ifconfig(&ifconfig)
    {
        found.interface = Some(iface);
        found.assigned_ip = Some(ip);
    }

    found
}

/// Bytes (sent, received) on `iface` since it came up.
pub fn interface_counters(iface: &str) -> Option<(u64, u64)> {
    let networks = Networks::new_with_refreshed_list();
    let data = networks.list().get(iface)?;
    Some((data.total_transmitted(), data.total_received()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_from_linux_routes() {
        let output = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags   MSS Window  irtt Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG        0 0          0 wlan0
0.0.0.0         10.8.0.5        128.0.0.0       UG        0 0          0 tun0
10.8.0.1        10.8.0.5        255.255.255.255 UGH       0 0          0 tun0
";
        assert_eq!(gateway_from_routes(output), Some("10.8.0.5".parse().unwrap()));
    }

    #[test]
    fn test_gateway_skips_non_ip_columns() {
        let output = "\
Destination        Gateway            Flags        Netif Expire
default            link#22            UCSg         utun3
10.8/24            10.8.0.1           UGSc         utun3
";
        assert_eq!(gateway_from_routes(output), Some("10.8.0.1".parse().unwrap()));
    }

    #[test]
    fn test_gateway_none_without_tunnel() {
        let output = "0.0.0.0 192.168.1.1 0.0.0.0 UG 0 0 0 eth0\n";
        assert_eq!(gateway_from_routes(output), None);
    }

    #[test]
    fn test_tunnel_address_modern_ifconfig() {
        let output = "\
eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500
        inet 192.168.1.20  netmask 255.255.255.0  broadcast 192.168.1.255
tun0: flags=4305<UP,POINTOPOINT,RUNNING,NOARP,MULTICAST>  mtu 1500
        inet 10.8.0.6  netmask 255.255.255.255  destination 10.8.0.5
";
        assert_eq!(
            tunnel_address_from_ifconfig(output),
            Some(("tun0".to_string(), "10.8.0.6".parse().unwrap()))
        );
    }

    #[test]
    fn test_tunnel_address_legacy_ifconfig() {
        let output = "\
tap0      Link encap:Ethernet  HWaddr 00:ff:aa:bb:cc:dd
          inet addr:10.9.0.2  Bcast:10.9.0.255  Mask:255.255.255.0
";
        assert_eq!(
            tunnel_address_from_ifconfig(output),
            Some(("tap0".to_string(), "10.9.0.2".parse().unwrap()))
        );
    }

    #[test]
    fn test_tunnel_address_none() {
        let output = "\
lo: flags=73<UP,LOOPBACK,RUNNING>  mtu 65536
        inet 127.0.0.1  netmask 255.0.0.0
";
        assert_eq!(tunnel_address_from_ifconfig(output), None);
    }

    #[test]
    fn test_counters_unknown_interface() {
        assert_eq!(interface_counters("vpnclient-no-such-if0"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_counters_loopback() {
        assert!(interface_counters("lo").is_some());
    }
}
