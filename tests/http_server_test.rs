//! Integration tests for the tuner HTTP surface.
//!
//! Drives a real axum server on an ephemeral port, backed by an in-memory
//! SQLite database. FFmpeg is replaced by `/bin/sh` plus an argv template
//! that emits bytes to stdout, so session lifecycle tests run without a real
//! transcoder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};

use plexbridge::config::{ConfigStore, Settings};
use plexbridge::db::schema::ffmpeg_profiles;
use plexbridge::db::{
    run_migrations, NewChannel, NewEpgProgram, NewEpgSource, NewStream, ProgramWindow, Repository,
};
use plexbridge::events::EventBus;
use plexbridge::metrics::Metrics;
use plexbridge::server::routes::create_router;
use plexbridge::server::AppState;
use plexbridge::stream::SessionManager;

/// Template that makes `/bin/sh` act as a byte-producing FFmpeg stand-in:
/// a burst of TS-sized output, then a long sleep holding the pipe open.
const SH_PROFILE_CLIENTS: &str = r#"{
  "web_browser": {
    "ffmpeg_args": "-c 'head -c 262144 /dev/zero; sleep 30'",
    "hls_args": ""
  }
}"#;

fn test_settings() -> Settings {
    Settings {
        max_concurrent_streams: 2,
        max_concurrent_per_channel: 3,
        grace_period_ms: 500,
        ssdp_enabled: false,
        device_id: "1A2B3C4D".to_string(),
        friendly_name: "PlexBridge".to_string(),
        advertised_host: Some("http://10.0.0.5:8080".to_string()),
        tuner_count: 4,
        ..Settings::default()
    }
}

fn create_test_app_state(settings: Settings) -> AppState {
    let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .expect("Failed to create test pool");

    let mut conn = pool.get().expect("Failed to get connection");
    run_migrations(&mut conn).expect("Failed to run migrations");
    drop(conn);

    let repo = Repository::new(pool.clone());
    let events = EventBus::new();
    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(ConfigStore::with_settings(
        repo.clone(),
        events.clone(),
        settings,
    ));
    let sessions = SessionManager::new(
        Arc::clone(&config),
        repo.clone(),
        events.clone(),
        Arc::clone(&metrics),
        "/bin/sh".to_string(),
    );

    AppState::new(pool, repo, config, sessions, events, metrics)
}

/// Swap the seeded default profile's templates for the sh-compatible stub.
fn install_sh_profile(state: &AppState) {
    let mut conn = state.pool().get().expect("conn");
    diesel::update(ffmpeg_profiles::table)
        .set(ffmpeg_profiles::clients.eq(SH_PROFILE_CLIENTS))
        .execute(&mut conn)
        .expect("profile update");
}

fn seed_channel_with_stream(state: &AppState, number: i32, name: &str, epg_id: Option<&str>) {
    let channel = state
        .repo
        .insert_channel(&NewChannel {
            number,
            name: name.to_string(),
            enabled: 1,
            logo_url: None,
            epg_id: epg_id.map(|s| s.to_string()),
        })
        .expect("channel");
    state
        .repo
        .insert_stream(&NewStream {
            channel_id: channel.id,
            name: format!("{name} feed"),
            url: "http://upstream.invalid/live.ts".to_string(),
            kind: "mpegts".to_string(),
            enabled: 1,
            auth: None,
            profile_id: None,
        })
        .expect("stream");
}

/// Start a test server on a random available port.
async fn start_test_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to port");
    let addr = listener.local_addr().expect("Failed to get local address");

    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("Server error");
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    (addr, handle)
}

async fn active_session_count(client: &reqwest::Client, addr: SocketAddr) -> usize {
    let body: serde_json::Value = client
        .get(format!("http://{}/streams/active", addr))
        .send()
        .await
        .expect("active request")
        .json()
        .await
        .expect("active json");
    body.as_array().map(|a| a.len()).unwrap_or(0)
}

async fn wait_for_no_sessions(client: &reqwest::Client, addr: SocketAddr) {
    for _ in 0..100 {
        if active_session_count(client, addr).await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    panic!("sessions did not drain");
}

// ============================================================================
// Basic surface
// ============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_200_ok() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/nonexistent", addr))
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 404);
}

// ============================================================================
// HDHomeRun surface
// ============================================================================

#[tokio::test]
async fn test_discover_json_reflects_identity() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/discover.json", addr))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["DeviceID"], "1A2B3C4D");
    assert_eq!(body["FriendlyName"], "PlexBridge");
    assert_eq!(body["Manufacturer"], "Silicondust");
    assert_eq!(body["BaseURL"], "http://10.0.0.5:8080");
    assert_eq!(body["LineupURL"], "http://10.0.0.5:8080/lineup.json");
    assert_eq!(body["TunerCount"], 4);
}

#[tokio::test]
async fn test_device_xml_served_as_xml() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/device.xml", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("application/xml"));

    let body = response.text().await.expect("body");
    assert!(body.contains("<UDN>uuid:1A2B3C4D</UDN>"));
}

#[tokio::test]
async fn test_lineup_lists_channels_with_enabled_streams() {
    let state = create_test_app_state(test_settings());
    seed_channel_with_stream(&state, 5, "CNN", None);

    // Channel without any stream must not appear.
    state
        .repo
        .insert_channel(&NewChannel {
            number: 6,
            name: "Empty".to_string(),
            enabled: 1,
            logo_url: None,
            epg_id: None,
        })
        .expect("channel");

    let (addr, _handle) = start_test_server(state).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/lineup.json", addr))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    let lineup = body.as_array().expect("array");
    assert_eq!(lineup.len(), 1);
    assert_eq!(lineup[0]["GuideNumber"], "5");
    assert_eq!(lineup[0]["GuideName"], "CNN");
    assert_eq!(lineup[0]["URL"], "http://10.0.0.5:8080/stream/5");
}

#[tokio::test]
async fn test_lineup_status_stub() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/lineup_status.json", addr))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["ScanInProgress"], 0);
    assert_eq!(body["ScanPossible"], 1);
    assert_eq!(body["Source"], "Cable");
}

#[tokio::test]
async fn test_playlist_m3u_shape() {
    let state = create_test_app_state(test_settings());
    seed_channel_with_stream(&state, 7, "BBC One", Some("bbc1"));
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/playlist.m3u", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "audio/x-mpegurl"
    );

    let body = response.text().await.expect("body");
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("tvg-id=\"bbc1\""));
    assert!(body.contains("http://10.0.0.5:8080/stream/7"));
}

// ============================================================================
// EPG emission
// ============================================================================

#[tokio::test]
async fn test_epg_xmltv_emits_programs_for_mapped_channels() {
    let state = create_test_app_state(test_settings());
    seed_channel_with_stream(&state, 1, "BBC One", Some("bbc1"));

    let source = state
        .repo
        .insert_epg_source(&NewEpgSource {
            name: "guide".to_string(),
            url: "http://example/epg.xml".to_string(),
            refresh_interval_secs: 3600,
            enabled: 1,
        })
        .expect("source");

    // One program inside the emission window.
    let now = chrono::Utc::now();
    let start = now + chrono::Duration::hours(1);
    let stop = now + chrono::Duration::hours(2);
    let fmt = |dt: chrono::DateTime<chrono::Utc>| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string();

    state
        .repo
        .replace_epg_programs(
            source.id,
            "bbc1",
            ProgramWindow::new(start, stop),
            &[NewEpgProgram {
                source_id: source.id,
                epg_id: "bbc1".to_string(),
                start_utc: fmt(start),
                stop_utc: fmt(stop),
                title: "News".to_string(),
                description: None,
                category: None,
            }],
        )
        .expect("programs");

    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/epg/xmltv", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("application/xml"));

    let body = response.text().await.expect("body");
    assert!(body.contains("<tv source-info-name=\"PlexBridge\">"));
    assert!(body.contains("<channel id=\"bbc1\">"));
    assert!(body.contains("channel=\"bbc1\"><title>News</title>"));
}

#[tokio::test]
async fn test_epg_xmltv_empty_guide_is_valid() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let body = reqwest::get(format!("http://{}/epg/xmltv", addr))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.starts_with("<?xml version=\"1.0\"?>"));
    assert!(body.contains("<tv source-info-name=\"PlexBridge\">"));
}

// ============================================================================
// Streaming sessions
// ============================================================================

#[tokio::test]
async fn test_stream_unknown_channel_returns_404() {
    let state = create_test_app_state(test_settings());
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/stream/99", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "NoStream");
}

#[tokio::test]
async fn test_stream_channel_without_enabled_stream_returns_404() {
    let state = create_test_app_state(test_settings());
    let channel = state
        .repo
        .insert_channel(&NewChannel {
            number: 3,
            name: "Dark".to_string(),
            enabled: 1,
            logo_url: None,
            epg_id: None,
        })
        .expect("channel");
    state
        .repo
        .insert_stream(&NewStream {
            channel_id: channel.id,
            name: "off".to_string(),
            url: "http://upstream.invalid/x.ts".to_string(),
            kind: "mpegts".to_string(),
            enabled: 0,
            auth: None,
            profile_id: None,
        })
        .expect("stream");
    let (addr, _handle) = start_test_server(state).await;

    let response = reqwest::get(format!("http://{}/stream/3", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "StreamDisabled");
}

#[tokio::test]
async fn test_capacity_limit_rejects_third_concurrent_stream() {
    let state = create_test_app_state(test_settings());
    install_sh_profile(&state);
    for number in 1..=3 {
        seed_channel_with_stream(&state, number, &format!("ch{number}"), None);
    }
    let (addr, _handle) = start_test_server(state).await;

    let client = reqwest::Client::new();

    // Two streams fill the tuner; hold their bodies open.
    let first = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream 1");
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers().get("content-type").unwrap(), "video/mp2t");

    let second = client
        .get(format!("http://{}/stream/2", addr))
        .send()
        .await
        .expect("stream 2");
    assert_eq!(second.status(), 200);

    // Third is refused synchronously with the capacity kind.
    let third = client
        .get(format!("http://{}/stream/3", addr))
        .send()
        .await
        .expect("stream 3");
    assert_eq!(third.status(), 503);
    let body: serde_json::Value = third.json().await.expect("json");
    assert_eq!(body["error"], "CapacityFull");

    assert_eq!(active_session_count(&client, addr).await, 2);

    // Disconnecting both clients returns the counters to zero.
    drop(first);
    drop(second);
    wait_for_no_sessions(&client, addr).await;

    // And capacity is available again.
    let again = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream 1 again");
    assert_eq!(again.status(), 200);
}

#[tokio::test]
async fn test_stream_body_carries_bytes_and_session_is_tracked() {
    let state = create_test_app_state(test_settings());
    install_sh_profile(&state);
    seed_channel_with_stream(&state, 1, "One", None);
    let (addr, _handle) = start_test_server(state).await;

    let client = reqwest::Client::new();
    let mut response = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store"
    );

    let chunk = response.chunk().await.expect("chunk").expect("some bytes");
    assert!(!chunk.is_empty());

    // The session is visible with metering fields.
    let sessions: serde_json::Value = client
        .get(format!("http://{}/streams/active", addr))
        .send()
        .await
        .expect("active")
        .json()
        .await
        .expect("json");
    let sessions = sessions.as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["channel_number"], 1);
    assert_eq!(sessions[0]["state"], "running");
    assert!(sessions[0]["bytes_sent"].as_u64().unwrap() > 0);

    drop(response);
    wait_for_no_sessions(&client, addr).await;
}

#[tokio::test]
async fn test_operator_termination_ends_session_and_is_idempotent() {
    let state = create_test_app_state(test_settings());
    install_sh_profile(&state);
    seed_channel_with_stream(&state, 1, "One", None);
    let (addr, _handle) = start_test_server(state).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream");
    assert_eq!(response.status(), 200);

    let sessions: serde_json::Value = client
        .get(format!("http://{}/streams/active", addr))
        .send()
        .await
        .expect("active")
        .json()
        .await
        .expect("json");
    let session_id = sessions[0]["session_id"].as_str().expect("id").to_string();

    let terminated = client
        .delete(format!("http://{}/streams/active/{}", addr, session_id))
        .send()
        .await
        .expect("terminate");
    assert_eq!(terminated.status(), 200);

    wait_for_no_sessions(&client, addr).await;

    // Terminating a closed session is a no-op returning success.
    let again = client
        .delete(format!("http://{}/streams/active/{}", addr, session_id))
        .send()
        .await
        .expect("terminate again");
    assert_eq!(again.status(), 200);

    drop(response);
}

#[tokio::test]
async fn test_startup_failure_maps_to_502() {
    let state = create_test_app_state(test_settings());
    // Default profile args are real FFmpeg flags; /bin/sh rejects them and
    // exits without output, which is a startup failure.
    seed_channel_with_stream(&state, 1, "One", None);
    let (addr, _handle) = start_test_server(state).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream");
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "Ffmpeg.StartupFailed");

    wait_for_no_sessions(&client, addr).await;
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_metrics_endpoint_tracks_sessions() {
    let state = create_test_app_state(test_settings());
    install_sh_profile(&state);
    seed_channel_with_stream(&state, 1, "One", None);
    let (addr, _handle) = start_test_server(state).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/stream/1", addr))
        .send()
        .await
        .expect("stream");
    assert_eq!(response.status(), 200);

    let metrics: serde_json::Value = client
        .get(format!("http://{}/api/metrics", addr))
        .send()
        .await
        .expect("metrics")
        .json()
        .await
        .expect("json");
    assert_eq!(metrics["sessions_started"], 1);
    assert_eq!(metrics["active_sessions"], 1);

    drop(response);
    wait_for_no_sessions(&client, addr).await;

    let metrics: serde_json::Value = client
        .get(format!("http://{}/api/metrics", addr))
        .send()
        .await
        .expect("metrics")
        .json()
        .await
        .expect("json");
    assert_eq!(metrics["active_sessions"], 0);
    assert_eq!(metrics["sessions_completed"], 1);
}
