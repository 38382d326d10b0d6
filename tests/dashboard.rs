#![cfg(unix)]

use vpnclient::app::VpnClientApp;
use vpnclient::connection::ConnectParams;
use vpnclient::connection::ConnectionStatus;
use vpnclient::protocol::Protocol;
use vpnclient::ui::Dashboard;
use vpnclient_test_utils::FakeBackends;

#[tokio::test]
async fn dashboard_connects_with_openvpn_profile_and_exits() {
    let backends = FakeBackends::new();
    let openvpn = backends.openvpn_ok();
    let profile = backends.dir().join("office.ovpn");
    std::fs::write(&profile, "client\nremote 127.0.0.1 1194\n").unwrap();

    let mut app = VpnClientApp::new(backends.config(openvpn));
    let script = format!("1\n1\n{}\nn\n\n4\ny\n", profile.display());

    let output = {
        let mut dashboard = Dashboard::new(&mut app, script.as_bytes(), Vec::new());
        dashboard.run().await.unwrap();
        String::from_utf8(dashboard.into_output()).unwrap()
    };

    assert!(output.contains("Connecting via OpenVPN..."), "{output}");
    assert!(output.contains("Connected."), "{output}");
    assert!(output.contains("Goodbye."), "{output}");
    assert_eq!(app.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn dashboard_reports_auth_failure() {
    let backends = FakeBackends::new();
    let openvpn = backends.openvpn_auth_failed();
    let profile = backends.dir().join("office.ovpn");
    std::fs::write(&profile, "client\n").unwrap();

    let mut app = VpnClientApp::new(backends.config(openvpn));
    let script = format!("1\n1\n{}\nn\nalice\nwrong\nn\n4\n", profile.display());

    let mut dashboard = Dashboard::new(&mut app, script.as_bytes(), Vec::new());
    dashboard.run().await.unwrap();
    let output = String::from_utf8(dashboard.into_output()).unwrap();

    assert!(output.contains("Connection ended: ERROR"), "{output}");
    assert!(output.contains("AUTH_FAILED"), "{output}");
    assert!(output.contains("Goodbye."), "{output}");
}

async fn run_script(app: &mut VpnClientApp, script: &str) -> String {
    let mut dashboard = Dashboard::new(app, script.as_bytes(), Vec::new());
    dashboard.run().await.unwrap();
    String::from_utf8(dashboard.into_output()).unwrap()
}

#[tokio::test]
async fn dashboard_exit_declined_keeps_tunnel_up() {
    let backends = FakeBackends::new();
    let openvpn = backends.openvpn_ok();
    let profile = backends.dir().join("office.ovpn");
    std::fs::write(&profile, "client\nremote 127.0.0.1 1194\n").unwrap();

    let mut app = VpnClientApp::new(backends.config(openvpn));
    let script = format!("1\n1\n{}\nn\n\n4\nn\n4\ny\n", profile.display());
    let output = run_script(&mut app, &script).await;

    let (_, after_decline) = output
        .split_once("Disconnect and exit? [y/N]: ")
        .expect("exit was not confirmed");
    let (before_second_exit, _) = after_decline
        .split_once("Disconnect and exit? [y/N]: ")
        .expect("second exit was not confirmed");
    assert!(before_second_exit.contains("Status: CONNECTED"), "{output}");
    assert!(!before_second_exit.contains("Goodbye."), "{output}");
    assert!(after_decline.contains("Goodbye."), "{output}");
    assert_eq!(app.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn dashboard_asks_before_abandoning_a_dial() {
    let backends = FakeBackends::new();
    let openvpn = backends.script(
        "openvpn",
        "trap 'exit 0' TERM\nwhile true; do sleep 0.1; done",
    );
    let mut config = backends.config(openvpn);
    config.connection.connect_timeout_secs = 60;
    let mut app = VpnClientApp::new(config);

    let params = ConnectParams {
        server: Some("127.0.0.1".to_string()),
        ..ConnectParams::default()
    };
    app.connect(Protocol::OpenVpn, params).await.unwrap();
    assert_eq!(app.status(), ConnectionStatus::Connecting);

    let output = run_script(&mut app, "4\nn\n").await;
    assert!(output.contains("Disconnect and exit? [y/N]: "), "{output}");
    let (_, after_decline) = output.split_once("Disconnect and exit? [y/N]: ").unwrap();
    assert!(after_decline.contains("Status: CONNECTING"), "{output}");
    assert!(!output.contains("Goodbye."), "{output}");

    app.shutdown().await;
    assert!(!app.status().is_active());
}
