//! SSDP/UPnP discovery responder.
//!
//! Listens on the SSDP multicast group for M-SEARCH datagrams and answers
//! with unicast 200 OK messages pointing Plex at `/device.xml`. Also emits
//! periodic `NOTIFY ssdp:alive` announcements (and once at startup) and
//! `ssdp:byebye` on shutdown. The socket is owned here exclusively.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::ConfigStore;

/// UPnP 1.0 recommends TTL 4 for SSDP multicast.
const MULTICAST_TTL: u32 = 4;

/// CACHE-CONTROL max-age advertised in responses and announcements.
const CACHE_MAX_AGE_SECS: u64 = 1800;

const SERVER_HEADER: &str = "HDHomeRun/1.0 UPnP/1.0 PlexBridge/1.0";

/// The three notification types an HDHomeRun-shaped device answers for.
fn search_targets(device_id: &str) -> [String; 3] {
    [
        "upnp:rootdevice".to_string(),
        "urn:schemas-upnp-org:device:MediaServer:1".to_string(),
        format!("uuid:{}", device_id),
    ]
}

/// USN for a given target: the bare uuid for the uuid target, uuid::target
/// otherwise.
fn usn_for(target: &str, device_id: &str) -> String {
    if target.starts_with("uuid:") {
        target.to_string()
    } else {
        format!("uuid:{}::{}", device_id, target)
    }
}

/// An M-SEARCH request we may answer.
#[derive(Debug, PartialEq, Eq)]
struct MSearch {
    st: String,
}

/// Parse an M-SEARCH datagram. Returns None for anything that is not a
/// well-formed discovery request (NOTIFY traffic from other devices lands on
/// the same group).
fn parse_msearch(datagram: &str) -> Option<MSearch> {
    let mut lines = datagram.lines();
    let request_line = lines.next()?;
    if !request_line.trim_start().starts_with("M-SEARCH") {
        return None;
    }

    let mut man = None;
    let mut st = None;
    for line in lines {
        let Some(idx) = line.find(':') else { continue };
        let (name, value) = line.split_at(idx);
        let value = value[1..].trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "man" => man = Some(value.trim_matches('"').to_string()),
            "st" => st = Some(value.to_string()),
            _ => {}
        }
    }

    if man.as_deref() != Some("ssdp:discover") {
        return None;
    }

    st.map(|st| MSearch { st })
}

/// Targets to answer for a given ST. `ssdp:all` gets all three.
fn matched_targets(st: &str, device_id: &str) -> Vec<String> {
    let targets = search_targets(device_id);
    if st == "ssdp:all" {
        return targets.to_vec();
    }
    targets.into_iter().filter(|t| t == st).collect()
}

/// Build one unicast M-SEARCH response.
fn build_msearch_response(target: &str, device_id: &str, location: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age={max_age}\r\n\
         EXT:\r\n\
         LOCATION: {location}\r\n\
         SERVER: {server}\r\n\
         ST: {target}\r\n\
         USN: {usn}\r\n\r\n",
        max_age = CACHE_MAX_AGE_SECS,
        location = location,
        server = SERVER_HEADER,
        target = target,
        usn = usn_for(target, device_id),
    )
}

/// Build a NOTIFY announcement (`ssdp:alive` or `ssdp:byebye`).
fn build_notify(
    target: &str,
    device_id: &str,
    location: &str,
    multicast: &str,
    alive: bool,
) -> String {
    let nts = if alive { "ssdp:alive" } else { "ssdp:byebye" };
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {multicast}\r\n\
         CACHE-CONTROL: max-age={max_age}\r\n\
         LOCATION: {location}\r\n\
         NT: {target}\r\n\
         NTS: {nts}\r\n\
         SERVER: {server}\r\n\
         USN: {usn}\r\n\r\n",
        multicast = multicast,
        max_age = CACHE_MAX_AGE_SECS,
        location = location,
        target = target,
        nts = nts,
        server = SERVER_HEADER,
        usn = usn_for(target, device_id),
    )
}

/// Create the multicast listener socket.
///
/// SO_REUSEADDR (and SO_REUSEPORT on Unix) so restarts and other UPnP
/// daemons coexist; joins the group on all interfaces.
fn create_ssdp_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Run the responder until the shutdown signal flips.
///
/// The first announce-interval tick fires immediately, covering the startup
/// `ssdp:alive` burst.
pub async fn run_ssdp(config: Arc<ConfigStore>, mut shutdown: watch::Receiver<bool>) {
    let settings = config.get();
    if !settings.ssdp_enabled {
        tracing::info!("SSDP responder disabled by configuration");
        return;
    }

    let group: Ipv4Addr = match settings.ssdp_multicast_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(
                address = %settings.ssdp_multicast_address,
                error = %e,
                "invalid SSDP multicast address"
            );
            return;
        }
    };
    let port = settings.discovery_port;

    let socket = match create_ssdp_socket(group, port) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(error = %e, port, "failed to open SSDP socket");
            return;
        }
    };

    let device_id = settings.device_id.to_uppercase();
    let location = format!("{}/device.xml", settings.base_url());
    let group_addr = format!("{}:{}", group, port);
    let announce_interval =
        Duration::from_millis(settings.ssdp_announce_interval_ms.max(1000));

    tracing::info!(
        %group_addr,
        %location,
        interval_secs = announce_interval.as_secs(),
        "SSDP responder running"
    );

    let mut announce = tokio::time::interval(announce_interval);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                send_notify_set(&socket, &group_addr, &device_id, &location, false).await;
                tracing::info!("SSDP responder stopped, byebye sent");
                return;
            }
            _ = announce.tick() => {
                send_notify_set(&socket, &group_addr, &device_id, &location, true).await;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let datagram = String::from_utf8_lossy(&buf[..len]);
                        handle_datagram(&socket, &datagram, src, &device_id, &location).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SSDP recv error");
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    datagram: &str,
    src: SocketAddr,
    device_id: &str,
    location: &str,
) {
    let Some(msearch) = parse_msearch(datagram) else {
        return;
    };

    let targets = matched_targets(&msearch.st, device_id);
    if targets.is_empty() {
        return;
    }

    tracing::debug!(%src, st = %msearch.st, responses = targets.len(), "answering M-SEARCH");
    for target in targets {
        let response = build_msearch_response(&target, device_id, location);
        if let Err(e) = socket.send_to(response.as_bytes(), src).await {
            tracing::warn!(%src, error = %e, "failed to send M-SEARCH response");
        }
    }
}

async fn send_notify_set(
    socket: &UdpSocket,
    group_addr: &str,
    device_id: &str,
    location: &str,
    alive: bool,
) {
    for target in search_targets(device_id) {
        let message = build_notify(&target, device_id, location, group_addr, alive);
        if let Err(e) = socket.send_to(message.as_bytes(), group_addr).await {
            tracing::warn!(error = %e, "failed to send SSDP NOTIFY");
        }
    }
}
