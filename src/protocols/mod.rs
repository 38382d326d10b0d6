//! Protocol backends and the factory choosing one for the running platform.

pub mod native;
pub mod openvpn;
pub mod ppp;
pub mod process;
pub mod scrape;
pub mod supervisor;
pub mod xl2tpd;

use std::sync::Arc;

use tracing::warn;

use self::native::NativeConnection;
use self::native::PollOptions;
use self::native::RasDialer;
use self::native::ScutilDialer;
use self::openvpn::OpenVpnLauncher;
use self::ppp::PppLauncher;
use self::process::ProcessConnection;
use self::supervisor::SupervisorOptions;
use self::xl2tpd::Xl2tpdLauncher;
use crate::config::AppConfig;
use crate::connection::VpnConnection;
use crate::error::Result;
use crate::error::VpnError;
use crate::metrics::NetworkMetrics;
use crate::platform::Platform;
use crate::protocol::Protocol;

pub fn create_connection(protocol: Protocol, config: &AppConfig) -> Result<Box<dyn VpnConnection>> {
    create_connection_for(protocol, Platform::current(), config)
}

/// Backend for `protocol` as it would be chosen on `platform`.
pub fn create_connection_for(
    protocol: Protocol,
    platform: Platform,
    config: &AppConfig,
) -> Result<Box<dyn VpnConnection>> {
    let metrics = NetworkMetrics::from_config(&config.metrics);
    let binaries = &config.binaries;
    let supervised = SupervisorOptions {
        connect_timeout: config.connection.connect_timeout(),
        stop_grace: config.connection.stop_grace(),
        discover_addresses: false,
    };
    let polled = PollOptions {
        interval: config.connection.poll_interval(),
        connect_timeout: config.connection.connect_timeout(),
    };

    let ras = || {
        Arc::new(RasDialer::new(
            protocol,
            binaries.rasdial.clone(),
            binaries.powershell.clone(),
        ))
    };
    let scutil = || Arc::new(ScutilDialer::new(binaries.scutil.clone()));

    let connection: Box<dyn VpnConnection> = match (protocol, platform) {
        (_, Platform::Unknown | Platform::Ios) => {
            return Err(VpnError::UnsupportedPlatform {
                protocol: protocol.to_string(),
                platform: platform.to_string(),
            });
        }
        (Protocol::OpenVpn, _) => Box::new(ProcessConnection::new(
            OpenVpnLauncher::new(binaries.openvpn.clone(), config.openvpn.clone()),
            metrics,
            SupervisorOptions {
                discover_addresses: true,
                ..supervised
            },
        )),
        (_, Platform::Windows) => {
            Box::new(NativeConnection::new(protocol, ras(), metrics, polled))
        }
        (Protocol::Pptp, Platform::MacOs) => {
            warn!("PPTP is deprecated on macOS and may be unavailable on recent releases");
            Box::new(NativeConnection::new(protocol, scutil(), metrics, polled))
        }
        (Protocol::L2tp, Platform::MacOs) => {
            Box::new(NativeConnection::new(protocol, scutil(), metrics, polled))
        }
        (Protocol::Sstp, _) => Box::new(ProcessConnection::new(
            PppLauncher::sstp(binaries.sstpc.clone()),
            metrics,
            supervised,
        )),
        (Protocol::Pptp, _) => Box::new(ProcessConnection::new(
            PppLauncher::pptp(binaries.pptp.clone()),
            metrics,
            supervised,
        )),
        (Protocol::L2tp, _) => Box::new(ProcessConnection::new(
            Xl2tpdLauncher::new(binaries.xl2tpd.clone()),
            metrics,
            supervised,
        )),
    };

    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;

    #[test]
    fn test_factory_covers_supported_platforms() {
        let config = AppConfig::default();
        for platform in [
            Platform::Windows,
            Platform::MacOs,
            Platform::Linux,
            Platform::Android,
        ] {
            for protocol in Protocol::ALL {
                let conn = create_connection_for(protocol, platform, &config).unwrap();
                assert_eq!(conn.protocol(), protocol);
                assert_eq!(conn.status(), ConnectionStatus::Disconnected);
                assert!(conn.connection_info().is_none());
            }
        }
    }

    #[test]
    fn test_factory_rejects_unknown_platform() {
        let err = create_connection_for(Protocol::Sstp, Platform::Unknown, &AppConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, VpnError::UnsupportedPlatform { .. }));
        assert_eq!(err.to_string(), "SSTP is not supported on unknown");
    }
}
