// End-to-end tests driving both feeds over loopback TCP
//
// A local listener stands in for the ADS-B decoder and for gpsd; the
// telemetry context connects to them exactly as it would on the badge.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use winglet_telemetry::settings::GPSD_WATCH_COMMAND;
use winglet_telemetry::{ConnectionState, GpsLockState, TelemetryConfig, TelemetryContext};

const UNDATED_POSITION: &str = "MSG,3,1,1,ABC123,1,,,,,,35000,,,40.5,-74.0,,,0,0,0,0\n";
const LOCKED_RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\n";
const GSV: &str = "$GPGSV,2,2,08,01,40,083,46,02,17,308,41,12,07,344,39,14,22,228,45*76\n";

struct Feeds {
    adsb: TcpListener,
    gps: TcpListener,
    config: TelemetryConfig,
}

async fn local_feeds() -> Feeds {
    let adsb = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gps = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = TelemetryConfig::default();
    config.adsb.host = "127.0.0.1".to_string();
    config.adsb.port = adsb.local_addr().unwrap().port();
    config.gps.host = "127.0.0.1".to_string();
    config.gps.port = gps.local_addr().unwrap().port();
    config.connection.connect_timeout_ms = 500;
    config.connection.retry_delay_ms = 200;
    config.adsb.sweep_interval_ms = 100;

    Feeds { adsb, gps, config }
}

async fn accept(listener: &TcpListener) -> TcpStream {
    let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("telemetry never connected")
        .unwrap();
    socket
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_gps_handshake_is_sent_on_every_connect() {
    let feeds = local_feeds().await;
    let mut context = TelemetryContext::from_config(&feeds.config);
    let shutdown = CancellationToken::new();
    let handles = context.start(shutdown.clone());

    for _ in 0..2 {
        let socket = accept(&feeds.gps).await;
        let mut reader = BufReader::new(socket);

        let mut first = String::new();
        let mut second = String::new();
        timeout(Duration::from_secs(5), async {
            reader.read_line(&mut first).await.unwrap();
            reader.read_line(&mut second).await.unwrap();
        })
        .await
        .expect("handshake not received");

        assert!(first.starts_with("?DEVICE="), "got {first:?}");
        assert_eq!(second, GPSD_WATCH_COMMAND);
        // Dropping the socket forces a reconnect
    }

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_disconnect_clears_aircraft_and_satellites() {
    let feeds = local_feeds().await;
    let mut context = TelemetryContext::from_config(&feeds.config);
    let shutdown = CancellationToken::new();
    let handles = context.start(shutdown.clone());

    let mut adsb = accept(&feeds.adsb).await;
    let mut gps = accept(&feeds.gps).await;

    gps.write_all(LOCKED_RMC.as_bytes()).await.unwrap();
    gps.write_all(GSV.as_bytes()).await.unwrap();

    let aircraft = context.aircraft().clone();
    let fixes = context.gps().clone();
    eventually("GPS lock", || {
        let fixes = fixes.clone();
        async move { fixes.gps_state() == GpsLockState::Locked }
    })
    .await;

    adsb.write_all(UNDATED_POSITION.as_bytes()).await.unwrap();
    eventually("aircraft to appear", || {
        let aircraft = aircraft.clone();
        async move { aircraft.len() == 1 }
    })
    .await;
    eventually("satellites to appear", || {
        let fixes = fixes.clone();
        async move { fixes.ephemeris().len() == 4 }
    })
    .await;

    // The GPS fix is the reference for the aircraft that arrived after it
    let track = aircraft.track(0xABC123).unwrap();
    assert!(!track.distance_nm.is_nan());

    drop(adsb);
    drop(gps);

    let mut adsb_state = context.adsb_link().subscribe();
    let mut gps_state = context.gps_link().subscribe();
    timeout(
        Duration::from_secs(5),
        adsb_state.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(
        Duration::from_secs(5),
        gps_state.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(aircraft.airspace().is_empty());
    assert!(fixes.ephemeris().is_empty());
    assert!(!fixes.last_reading().valid);
    assert_eq!(fixes.gps_state(), GpsLockState::Disconnected);
    // The last position is kept for the next session
    assert!(fixes.last_known_position().is_some());

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_shutdown_while_connected_clears_tables() {
    let feeds = local_feeds().await;
    let mut context = TelemetryContext::from_config(&feeds.config);
    let shutdown = CancellationToken::new();
    let handles = context.start(shutdown.clone());

    let mut adsb = accept(&feeds.adsb).await;
    let _gps = accept(&feeds.gps).await;
    adsb.write_all(UNDATED_POSITION.as_bytes()).await.unwrap();

    let aircraft = context.aircraft().clone();
    eventually("aircraft to appear", || {
        let aircraft = aircraft.clone();
        async move { !aircraft.is_empty() }
    })
    .await;

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(aircraft.is_empty());
    assert_eq!(context.adsb_link().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let feeds = local_feeds().await;
    let mut context = TelemetryContext::from_config(&feeds.config);
    let shutdown = CancellationToken::new();

    let handles = context.start(shutdown.clone());
    assert_eq!(handles.len(), 3);
    assert!(context.start(shutdown.clone()).is_empty());

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
