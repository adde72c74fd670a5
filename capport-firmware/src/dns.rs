//! Captive portal DNS responder.
//!
//! Answers every A query with the AP's IP address so that any hostname a
//! client resolves — `captive.apple.com`, `connectivitycheck.gstatic.com`,
//! `www.msftconnecttest.com`, anything — lands on the portal's HTTP
//! server. Non-A questions are echoed but never answered.

use crate::tasks::{spawn_named, WatchdogHandle};
use capport_dns_wire::{build_hijack_reply, DnsQuery, MAX_REPLY_SIZE};
use log::{debug, info, warn};
use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

const DNS_PORT: u16 = 53;

/// Bind the hijacker socket and spawn the responder thread.
///
/// The bind happens on the caller's thread so a failure (port taken,
/// interface down) aborts portal startup instead of dying silently in
/// the background.
///
/// # Errors
///
/// Returns the bind or socket-option error; no thread is spawned.
pub fn start_dns_server(ap_ip: Ipv4Addr) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", DNS_PORT))?;
    // Wake up every ~3s so the watchdog is fed well within its 5s default
    socket.set_read_timeout(Some(Duration::from_secs(3)))?;

    info!("DNS hijacker listening on port {DNS_PORT}, answering with {ap_ip}");

    spawn_named(c"dns_srv", move || run_dns_server(&socket, ap_ip));
    Ok(())
}

fn run_dns_server(socket: &UdpSocket, ap_ip: Ipv4Addr) {
    let watchdog = WatchdogHandle::register(c"dns_server");

    // One receive buffer and one reply buffer per responder; both live
    // for the thread, each datagram is processed to completion.
    let mut buf = [0u8; 512];
    let mut reply = [0u8; MAX_REPLY_SIZE];

    loop {
        watchdog.feed();

        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(result) => result,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Timeout - just continue to feed watchdog
                continue;
            }
            Err(e) => {
                warn!("DNS recv error: {e}");
                continue;
            }
        };

        let datagram = &buf[..len];
        let query = match DnsQuery::parse(datagram) {
            Ok(query) => query,
            Err(e) => {
                debug!("DNS: dropping malformed datagram from {}: {e}", src.ip());
                continue;
            }
        };

        for question in query.a_questions() {
            debug!("DNS A query for {} from {}, answering {ap_ip}", question.name, src.ip());
        }

        let reply_len = build_hijack_reply(&query, datagram, ap_ip, &mut reply);
        if let Err(e) = socket.send_to(&reply[..reply_len], src) {
            warn!("DNS send error: {e}");
        }
    }
}
