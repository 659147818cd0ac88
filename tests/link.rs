use hover_robot_link::domain::models::{AxisControl, ConnectionStatus, DeviceAddress, PidSettings};
use hover_robot_link::domain::settings::LinkConfig;
use hover_robot_link::infrastructure::bluetooth::protocol::{self, WRITE_CHAR_UUID};
use hover_robot_link::infrastructure::bluetooth::simulated::SimulatedTransport;
use hover_robot_link::{BleError, BluetoothService, DispatchError, PeripheralIdentity, ScanOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn robot(raw: u64) -> PeripheralIdentity {
    PeripheralIdentity::new(DeviceAddress::new(raw), Some("HoverRobot".to_string()))
}

fn setup() -> (Arc<SimulatedTransport>, BluetoothService) {
    let sim = Arc::new(SimulatedTransport::robot());
    let service = BluetoothService::new(sim.clone(), LinkConfig::default());
    (sim, service)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn expect(rx: &mut broadcast::Receiver<ConnectionStatus>, seq: &[ConnectionStatus]) {
    for want in seq {
        assert_eq!(rx.recv().await.unwrap(), *want);
    }
}

async fn connected(sim: &SimulatedTransport, service: &BluetoothService, raw: u64) {
    let mut status = service.connection_status();
    service.connect(robot(raw)).await.unwrap();
    expect(
        &mut status,
        &[
            ConnectionStatus::Connecting,
            ConnectionStatus::ServiceDiscovery,
            ConnectionStatus::Connected,
        ],
    )
    .await;
    assert_eq!(sim.connected(), Some(DeviceAddress::new(raw)));
}

fn telemetry_bytes(pitch: f32, speed_left: i16, speed_right: i16) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&pitch.to_le_bytes());
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&0f32.to_le_bytes());
    bytes.extend_from_slice(&speed_left.to_le_bytes());
    bytes.extend_from_slice(&speed_right.to_le_bytes());
    bytes
}

#[tokio::test]
async fn test_scan_then_connect_stops_the_scan() {
    let (sim, service) = setup();
    let mut status = service.connection_status();
    let mut snapshots = service.discovered_devices();

    assert_eq!(service.start_scan().await.unwrap(), ScanOutcome::Started);
    assert!(snapshots.recv().await.unwrap().is_empty());
    assert!(sim.advertise(robot(1)));
    assert!(sim.advertise(robot(1)));
    assert!(sim.advertise(robot(2)));
    settle().await;

    assert_eq!(snapshots.recv().await.unwrap().len(), 1);
    assert_eq!(snapshots.recv().await.unwrap().len(), 2);
    assert_eq!(service.latest_snapshot().len(), 2);

    service.connect(robot(2)).await.unwrap();
    assert!(!sim.is_scanning());
    assert!(!service.is_scanning().await);
    expect(
        &mut status,
        &[
            ConnectionStatus::Scanning,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::ServiceDiscovery,
            ConnectionStatus::Connected,
        ],
    )
    .await;
    assert!(service.is_connected());
    assert_eq!(
        service.connected_device().map(|d| d.address),
        Some(DeviceAddress::new(2))
    );
}

#[tokio::test]
async fn test_connect_replaces_existing_link() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;

    let mut status = service.connection_status();
    service.connect(robot(2)).await.unwrap();
    expect(
        &mut status,
        &[
            ConnectionStatus::Disconnecting,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::ServiceDiscovery,
            ConnectionStatus::Connected,
        ],
    )
    .await;

    assert_eq!(sim.disconnects(), 1);
    assert_eq!(
        sim.connects(),
        vec![DeviceAddress::new(1), DeviceAddress::new(2)]
    );
    assert_eq!(sim.connected(), Some(DeviceAddress::new(2)));
}

#[tokio::test]
async fn test_reconnect_after_drop_lands_on_new_device() {
    for _ in 0..40 {
        let (sim, service) = setup();
        connected(&sim, &service, 1).await;
        let mut status = service.connection_status();

        // Loss notice for device 1 races the connect request
        sim.drop_link();
        service.connect(robot(2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while status.recv().await.unwrap() != ConnectionStatus::Connected {}
        })
        .await
        .unwrap();
        settle().await;

        assert_eq!(service.current_status(), ConnectionStatus::Connected);
        assert_eq!(
            service.connected_device().map(|d| d.address),
            Some(DeviceAddress::new(2))
        );
        assert_eq!(sim.connected(), Some(DeviceAddress::new(2)));
    }
}

#[tokio::test]
async fn test_connect_with_radio_off_is_refused() {
    let (sim, service) = setup();
    sim.set_radio_enabled(false);

    assert!(!service.is_radio_enabled().await);
    assert_eq!(
        service.connect(robot(1)).await,
        Err(BleError::RadioUnavailable)
    );
    assert_eq!(service.start_scan().await, Err(BleError::RadioUnavailable));
    assert_eq!(service.current_status(), ConnectionStatus::Uninitialized);
    assert!(sim.connects().is_empty());
}

#[tokio::test]
async fn test_scan_refused_while_connecting() {
    let (sim, service) = setup();
    sim.hold_connects();

    service.connect(robot(1)).await.unwrap();
    assert_eq!(
        service.start_scan().await,
        Err(BleError::RadioBusy(ConnectionStatus::Connecting))
    );
    assert!(!sim.is_scanning());

    sim.release_connects(1);
}

#[tokio::test]
async fn test_send_before_connect_fails_fast() {
    let (sim, service) = setup();

    assert_eq!(
        service.send(AxisControl::new(10, 10)).await,
        Err(DispatchError::EndpointNotReady)
    );
    assert!(matches!(
        service.submit(PidSettings::default()),
        Err(DispatchError::EndpointNotReady)
    ));
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn test_send_without_write_characteristic_fails_fast() {
    let (sim, service) = setup();
    sim.set_services(vec![hover_robot_link::domain::models::GattService {
        uuid: protocol::SERVICE_UUID,
        characteristics: vec![protocol::NOTIFY_CHAR_UUID],
    }]);
    connected(&sim, &service, 1).await;

    assert_eq!(
        service.send(AxisControl::new(1, 1)).await,
        Err(DispatchError::EndpointNotReady)
    );
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn test_commands_are_written_in_wire_format() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;

    let pid = PidSettings {
        kp: 1.5,
        ki: 0.25,
        kd: -2.0,
        center_angle: 0.5,
        safety_limits: 45.0,
    };
    service.send(AxisControl::new(250, -30)).await.unwrap();
    service.send(pid).await.unwrap();

    let writes = sim.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], protocol::encode_axis_control(100, -30));
    assert_eq!(writes[1][0], protocol::FRAME_PID_SETTINGS);
    assert_eq!(writes[1].len(), protocol::PID_SETTINGS_LEN);
    assert_eq!(writes[1][1..5], 1.5f32.to_le_bytes());
}

#[tokio::test]
async fn test_queued_axis_samples_coalesce_but_settings_do_not() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;
    sim.hold_writes();

    let a = service.submit(AxisControl::new(1, 0)).unwrap();
    settle().await;
    assert_eq!(sim.writes().len(), 1);

    let b = service.submit(AxisControl::new(2, 0)).unwrap();
    let p = service
        .submit(PidSettings {
            kp: 3.0,
            ..Default::default()
        })
        .unwrap();
    let c = service.submit(AxisControl::new(3, 0)).unwrap();

    sim.ack_writes(3);
    assert_eq!(a.await.unwrap(), Ok(()));
    assert_eq!(b.await.unwrap(), Err(DispatchError::Superseded));
    assert_eq!(p.await.unwrap(), Ok(()));
    assert_eq!(c.await.unwrap(), Ok(()));

    let writes = sim.writes();
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0], protocol::encode_axis_control(1, 0));
    assert_eq!(writes[1][0], protocol::FRAME_PID_SETTINGS);
    assert_eq!(writes[2], protocol::encode_axis_control(3, 0));
    assert_eq!(sim.max_outstanding_writes(), 1);
}

#[tokio::test]
async fn test_concurrent_senders_never_overlap_writes() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;
    let service = Arc::new(service);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50i16 {
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            if i % 10 == 0 {
                service
                    .send(PidSettings {
                        kp: i as f32,
                        ..Default::default()
                    })
                    .await
            } else {
                service.send(AxisControl::new(i, -i)).await
            }
        });
    }

    let mut delivered = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(()) => delivered += 1,
            Err(DispatchError::Superseded) => {}
            Err(e) => panic!("unexpected dispatch error: {}", e),
        }
    }

    assert_eq!(sim.max_outstanding_writes(), 1);
    assert_eq!(sim.writes().len(), delivered);
    let settings = sim
        .writes()
        .iter()
        .filter(|w| w[0] == protocol::FRAME_PID_SETTINGS)
        .count();
    assert_eq!(settings, 5);
}

#[tokio::test]
async fn test_write_failure_drops_the_link() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;
    let mut status = service.connection_status();

    sim.fail_next_write(BleError::transport("status 0x85"));
    assert_eq!(
        service.send(AxisControl::new(5, 5)).await,
        Err(DispatchError::Transport("status 0x85".to_string()))
    );

    expect(&mut status, &[ConnectionStatus::Disconnected]).await;
    assert!(!service.is_connected());
    assert!(service.connected_device().is_none());
    assert_eq!(
        service.send(AxisControl::new(5, 5)).await,
        Err(DispatchError::EndpointNotReady)
    );
}

#[tokio::test]
async fn test_telemetry_flows_end_to_end() {
    let (sim, service) = setup();
    let mut telemetry = service.telemetry();
    connected(&sim, &service, 1).await;

    sim.notify(&[0u8; 15]);
    sim.notify(&telemetry_bytes(1.25, 300, -300));
    sim.notify_on(WRITE_CHAR_UUID, &telemetry_bytes(9.0, 9, 9));
    settle().await;

    let frame = telemetry.recv().await.unwrap();
    assert_eq!(frame.pitch, 1.25);
    assert_eq!(frame.speed_left, 300);
    assert_eq!(frame.speed_right, -300);
    assert!(frame.pid.is_none());
    assert!(telemetry.try_recv().is_err());

    let stats = service.frame_stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.dropped, 1);
}

#[tokio::test]
async fn test_telemetry_stops_after_disconnect() {
    let (sim, service) = setup();
    let mut telemetry = service.telemetry();
    connected(&sim, &service, 1).await;

    service.disconnect().await.unwrap();
    assert_eq!(service.current_status(), ConnectionStatus::Disconnected);

    sim.notify(&telemetry_bytes(0.0, 1, 1));
    settle().await;
    assert!(telemetry.try_recv().is_err());
    assert_eq!(service.frame_stats().accepted, 0);
}

#[tokio::test]
async fn test_lost_link_is_reported_once() {
    let (sim, service) = setup();
    connected(&sim, &service, 1).await;
    let mut status = service.connection_status();

    sim.drop_link();
    expect(&mut status, &[ConnectionStatus::Disconnected]).await;
    settle().await;
    assert!(status.try_recv().is_err());
    assert!(!service.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_scan_window_ends_on_its_own() {
    let sim = Arc::new(SimulatedTransport::robot());
    let config = LinkConfig {
        scan_window: Duration::from_secs(2),
        ..LinkConfig::default()
    };
    let service = BluetoothService::new(sim.clone(), config);
    let mut status = service.connection_status();

    service.start_scan().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(sim.is_scanning());

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;
    assert!(!sim.is_scanning());
    assert!(!service.is_scanning().await);
    expect(
        &mut status,
        &[ConnectionStatus::Scanning, ConnectionStatus::Disconnected],
    )
    .await;
}
