//! Classification of backend output lines.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::connection::ConnectionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Connected,
    Disconnected,
    AuthFailed,
    Failed,
}

/// Address or interface facts found in a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    LocalAddr(IpAddr),
    LocalNet(IpNet),
    RemoteAddr(IpAddr),
    Interface(String),
}

impl Hint {
    pub fn apply_to(&self, info: &mut ConnectionInfo) {
        match self {
            Hint::LocalAddr(ip) => info.assigned_ip = Some(*ip),
            Hint::LocalNet(net) => info.assigned_network = Some(*net),
            Hint::RemoteAddr(ip) => info.server_ip = Some(*ip),
            Hint::Interface(name) => info.interface = Some(name.clone()),
        }
    }
}

pub trait OutputScraper: Send + Sync {
    fn classify(&self, line: &str) -> Option<LineEvent>;

    fn hints(&self, _line: &str) -> Vec<Hint> {
        Vec::new()
    }
}

fn word_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let (_, rest) = line.split_once(marker)?;
    rest.split_whitespace().next()
}

fn netmask_prefix(mask: IpAddr) -> Option<u8> {
    match mask {
        IpAddr::V4(mask) => {
            let bits = u32::from(mask);
            // Reject non-contiguous masks.
            if bits.leading_ones() + bits.trailing_zeros() != 32 {
                return None;
            }
            Some(bits.leading_ones() as u8)
        }
        IpAddr::V6(_) => None,
    }
}

pub struct OpenVpnScraper;

impl OutputScraper for OpenVpnScraper {
    fn classify(&self, line: &str) -> Option<LineEvent> {
        if line.contains("Initialization Sequence Completed") {
            Some(LineEvent::Connected)
        } else if line.contains("AUTH_FAILED") {
            Some(LineEvent::AuthFailed)
        } else if line.contains("SIGTERM") || line.contains("process exiting") {
            Some(LineEvent::Disconnected)
        } else if line.contains("ERROR") {
            Some(LineEvent::Failed)
        } else {
            None
        }
    }

    fn hints(&self, line: &str) -> Vec<Hint> {
        let mut hints = Vec::new();

        if line.contains("TUN/TAP device")
            && line.contains("opened")
            && let Some(dev) = word_after(line, "TUN/TAP device")
        {
            hints.push(Hint::Interface(dev.to_string()));
        }

        if line.contains("PUSH_REPLY")
            && let Some((_, rest)) = line.split_once("ifconfig ")
        {
            let mut words = rest.split(|c: char| c == ',' || c.is_whitespace());
            let addr = words.next().and_then(|w| w.parse::<IpAddr>().ok());
            let mask = words.next().and_then(|w| w.parse::<IpAddr>().ok());
            if let Some(addr) = addr {
                hints.push(Hint::LocalAddr(addr));
                if let Some(prefix) = mask.and_then(netmask_prefix)
                    && let Ok(net) = IpNet::new(addr, prefix)
                {
                    hints.push(Hint::LocalNet(net.trunc()));
                }
            }
        }

        if let Some(peer) = word_after(line, "Peer Connection Initiated with") {
            let peer = peer.trim_start_matches("[AF_INET]").trim_start_matches("[AF_INET6]");
            let host = peer.rsplit_once(':').map_or(peer, |(host, _)| host);
            if let Ok(ip) = host.parse::<IpAddr>() {
                hints.push(Hint::RemoteAddr(ip));
            }
        }

        hints
    }
}

/// pppd output, shared by the SSTP and PPTP clients.
pub struct PppScraper;

impl OutputScraper for PppScraper {
    fn classify(&self, line: &str) -> Option<LineEvent> {
        let lower = line.to_lowercase();
        if line.contains("local  IP address") {
            Some(LineEvent::Connected)
        } else if lower.contains("authentication failed") {
            Some(LineEvent::AuthFailed)
        } else if line.contains("Connection terminated") || line.contains("Modem hangup") {
            Some(LineEvent::Disconnected)
        } else if lower.trim_start().starts_with("error") || line.contains("LCP: timeout") {
            Some(LineEvent::Failed)
        } else {
            None
        }
    }

    fn hints(&self, line: &str) -> Vec<Hint> {
        let mut hints = Vec::new();
        let ip = |marker| word_after(line, marker).and_then(|w| w.parse::<IpAddr>().ok());

        if let Some(addr) = ip("local  IP address") {
            hints.push(Hint::LocalAddr(addr));
        }
        if let Some(addr) = ip("remote IP address") {
            hints.push(Hint::RemoteAddr(addr));
        }
        if let Some(iface) = word_after(line, "Using interface") {
            hints.push(Hint::Interface(iface.to_string()));
        }

        hints
    }
}

/// xl2tpd output interleaved with its pppd child.
pub struct Xl2tpdScraper;

impl OutputScraper for Xl2tpdScraper {
    fn classify(&self, line: &str) -> Option<LineEvent> {
        if line.contains("Call established with") {
            Some(LineEvent::Connected)
        } else if line.contains("Connection closed to") || line.contains("Terminating pppd") {
            Some(LineEvent::Disconnected)
        } else if line.contains("Maximum retries exceeded") || line.contains("Can not find tunnel")
        {
            Some(LineEvent::Failed)
        } else {
            PppScraper
                .classify(line)
                .filter(|event| *event == LineEvent::AuthFailed)
        }
    }

    fn hints(&self, line: &str) -> Vec<Hint> {
        PppScraper.hints(line)
    }
}
