use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::VpnError;

/// VPN protocols the client can drive through an external backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[value(name = "openvpn")]
    OpenVpn,
    Sstp,
    L2tp,
    Pptp,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::OpenVpn,
        Protocol::Sstp,
        Protocol::L2tp,
        Protocol::Pptp,
    ];

    /// Lowercase identifier used on the command line and in config files.
    pub fn id(self) -> &'static str {
        match self {
            Protocol::OpenVpn => "openvpn",
            Protocol::Sstp => "sstp",
            Protocol::L2tp => "l2tp",
            Protocol::Pptp => "pptp",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Protocol::OpenVpn => "OpenVPN",
            Protocol::Sstp => "SSTP",
            Protocol::L2tp => "L2TP",
            Protocol::Pptp => "PPTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Protocol {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| VpnError::UnsupportedProtocol(s.to_string()))
    }
}
