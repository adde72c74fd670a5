//! Captive portal probe client
//!
//! Emulates the connectivity probes that iOS, Android, Windows and macOS
//! issue on network join, against a running capport device, and verifies
//! that each one is intercepted the way its OS expects.
//!
//! Usage: cargo run -p capport-probe-client -- --address 192.168.4.1

use capport_dns_wire::{ANSWER_TTL, CLASS_IN, HEADER_SIZE, TYPE_A};
use capport_portal_lib::{redirect_url, ProbeAction, PROBE_ROUTES};
use clap::Parser;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "capport-probe")]
#[command(about = "Exercise a capport device with OS connectivity probes")]
struct Args {
    /// Device AP address
    #[arg(short, long, default_value = "192.168.4.1")]
    address: Ipv4Addr,

    /// Portal hostname the device redirects probes to
    #[arg(long, default_value = "setup.device.local")]
    hostname: String,

    /// Expect https redirects (device has a TLS certificate installed)
    #[arg(long)]
    ssl: bool,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value = "3")]
    timeout: u64,

    /// Print response details for every check
    #[arg(short, long)]
    verbose: bool,
}

struct Stats {
    passed: u32,
    failed: u32,
}

impl Stats {
    fn new() -> Self {
        Self { passed: 0, failed: 0 }
    }

    fn record(&mut self, name: &str, result: Result<String, String>, verbose: bool) {
        match result {
            Ok(detail) => {
                self.passed += 1;
                if verbose {
                    println!("PASS  {name}: {detail}");
                } else {
                    println!("PASS  {name}");
                }
            }
            Err(reason) => {
                self.failed += 1;
                println!("FAIL  {name}: {reason}");
            }
        }
    }

    fn print_summary(&self) {
        println!("\n=== Probe Summary ===");
        println!("Passed: {}", self.passed);
        println!("Failed: {}", self.failed);
    }
}

/// Encode a single-question DNS query.
fn encode_dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        out.push(u8::try_from(label.len()).expect("label fits in a length octet"));
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}

/// Skip a possibly-compressed name at `pos`, returning the offset of the
/// fixed fields that follow it.
fn skip_name(response: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        let len = *response.get(pos).ok_or("truncated name")?;
        if len & 0xC0 == 0xC0 {
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + usize::from(len);
    }
}

struct DnsAnswer {
    ip: Ipv4Addr,
    ttl: u32,
}

/// Parse a reply to a single-question query: verify the header, then
/// return the first A answer (if any).
fn parse_dns_reply(response: &[u8], id: u16) -> Result<Option<DnsAnswer>, String> {
    if response.len() < HEADER_SIZE {
        return Err(format!("short reply: {} bytes", response.len()));
    }
    if u16::from_be_bytes([response[0], response[1]]) != id {
        return Err("transaction id mismatch".to_string());
    }
    if u16::from_be_bytes([response[2], response[3]]) & 0x8000 == 0 {
        return Err("QR bit not set".to_string());
    }
    let qd_count = u16::from_be_bytes([response[4], response[5]]);
    let an_count = u16::from_be_bytes([response[6], response[7]]);

    let mut pos = HEADER_SIZE;
    for _ in 0..qd_count {
        pos = skip_name(response, pos)? + 4;
    }
    for _ in 0..an_count {
        pos = skip_name(response, pos)?;
        let fixed = response.get(pos..pos + 10).ok_or("truncated answer")?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rd_length = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
        pos += 10;
        let rdata = response
            .get(pos..pos + rd_length)
            .ok_or("truncated rdata")?;
        pos += rd_length;

        if rtype == TYPE_A && rd_length == 4 {
            return Ok(Some(DnsAnswer {
                ip: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
                ttl,
            }));
        }
    }
    Ok(None)
}

fn dns_exchange(args: &Args, id: u16, name: &str, qtype: u16) -> Result<Vec<u8>, String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| format!("bind: {e}"))?;
    socket
        .set_read_timeout(Some(Duration::from_secs(args.timeout)))
        .map_err(|e| format!("timeout: {e}"))?;

    let query = encode_dns_query(id, name, qtype);
    let target = SocketAddr::new(IpAddr::V4(args.address), 53);
    socket.send_to(&query, target).map_err(|e| format!("send: {e}"))?;

    let mut buf = [0u8; 512];
    let (len, _) = socket.recv_from(&mut buf).map_err(|e| format!("recv: {e}"))?;
    Ok(buf[..len].to_vec())
}

/// Every A lookup must come back as the AP address with the hijack TTL.
fn check_dns_hijack(args: &Args, id: u16, name: &str) -> Result<String, String> {
    let reply = dns_exchange(args, id, name, TYPE_A)?;
    let answer = parse_dns_reply(&reply, id)?
        .ok_or_else(|| format!("no A answer for {name}"))?;

    if answer.ip != args.address {
        return Err(format!("answered {} instead of {}", answer.ip, args.address));
    }
    if answer.ttl != ANSWER_TTL {
        return Err(format!("TTL {} instead of {ANSWER_TTL}", answer.ttl));
    }
    Ok(format!("{name} -> {} (ttl {})", answer.ip, answer.ttl))
}

/// Non-A questions are echoed but never answered.
fn check_dns_non_a(args: &Args, id: u16) -> Result<String, String> {
    const TYPE_AAAA: u16 = 28;
    let reply = dns_exchange(args, id, "example.com", TYPE_AAAA)?;
    match parse_dns_reply(&reply, id)? {
        Some(answer) => Err(format!("unexpected A answer {}", answer.ip)),
        None => {
            let an_count = u16::from_be_bytes([reply[6], reply[7]]);
            if an_count == 0 {
                Ok("AAAA reply carries zero answers".to_string())
            } else {
                Err(format!("{an_count} non-A answers in reply"))
            }
        }
    }
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn http_get(
    args: &Args,
    path: &str,
    host: &str,
    user_agent: &str,
) -> Result<HttpResponse, String> {
    let target = SocketAddr::new(IpAddr::V4(args.address), 80);
    let mut stream = TcpStream::connect_timeout(&target, Duration::from_secs(args.timeout))
        .map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(args.timeout)))
        .map_err(|e| format!("timeout: {e}"))?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {user_agent}\r\n\
         Accept-Encoding: gzip\r\nConnection: close\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("send: {e}"))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .map_err(|e| format!("recv: {e}"))?;
    let text = String::from_utf8_lossy(&raw);

    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or("no header/body separator in response")?;
    let mut lines = head.lines();
    let status_line = lines.next().ok_or("empty response")?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| format!("bad status line: {status_line}"))?;

    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(HttpResponse {
        status,
        headers,
        body: body.to_string(),
    })
}

/// One probe path, verified against its expected response class.
fn check_probe_path(
    args: &Args,
    expected_url: &str,
    path: &str,
    action: ProbeAction,
) -> Result<String, String> {
    let response = http_get(args, path, "connectivitycheck.gstatic.com", "Mozilla/5.0")?;
    match action {
        ProbeAction::ServeRedirectHtml => {
            if response.status != 200 {
                return Err(format!("status {} instead of 200", response.status));
            }
            let marker = format!("content='0; url={expected_url}'");
            if !response.body.contains(&marker) {
                return Err("meta-refresh body missing redirect URL".to_string());
            }
            Ok(format!("200 with meta-refresh to {expected_url}"))
        }
        ProbeAction::Redirect => {
            if response.status != 302 {
                return Err(format!("status {} instead of 302", response.status));
            }
            match response.header("Location") {
                Some(location) if location == expected_url => {
                    Ok(format!("302 -> {location}"))
                }
                Some(location) => Err(format!("Location {location} instead of {expected_url}")),
                None => Err("no Location header".to_string()),
            }
        }
    }
}

/// The portal root must serve HTML for the portal hostname.
fn check_portal_root(args: &Args) -> Result<String, String> {
    let response = http_get(args, "/", &args.hostname, "Mozilla/5.0")?;
    if response.status != 200 {
        return Err(format!("status {} instead of 200", response.status));
    }
    match response.header("Content-Type") {
        Some(content_type) if content_type.starts_with("text/html") => {
            Ok(format!("200, {} body bytes", response.body.len()))
        }
        Some(content_type) => Err(format!("content type {content_type}")),
        None => Err("no Content-Type header".to_string()),
    }
}

/// Apple's captive network assistant is redirected even on a foreign host.
fn check_captive_agent_redirect(args: &Args, expected_url: &str) -> Result<String, String> {
    let response = http_get(
        args,
        "/",
        "captive.apple.com",
        "CaptiveNetworkSupport-355.200.10 wispr",
    )?;
    if response.status != 302 {
        return Err(format!("status {} instead of 302", response.status));
    }
    match response.header("Location") {
        Some(location) if location == expected_url => Ok(format!("302 -> {location}")),
        Some(location) => Err(format!("Location {location} instead of {expected_url}")),
        None => Err("no Location header".to_string()),
    }
}

/// A foreign host without a captive agent never gets the portal index.
fn check_foreign_root_not_index(args: &Args) -> Result<String, String> {
    let response = http_get(args, "/", "example.com", "Mozilla/5.0")?;
    match response.status {
        404 => Ok("404 for foreign-host root".to_string()),
        200 => Err("served a document to a foreign host".to_string()),
        other => Err(format!("unexpected status {other}")),
    }
}

fn main() {
    let args = Args::parse();
    let expected_url = redirect_url(&args.hostname, args.ssl);

    println!(
        "Probing {} (portal {} -> {expected_url})...\n",
        args.address, args.hostname
    );

    let mut stats = Stats::new();

    // DNS universality: well-known probe hostnames all resolve to the AP
    for (index, name) in [
        "captive.apple.com",
        "connectivitycheck.gstatic.com",
        "www.msftconnecttest.com",
    ]
    .into_iter()
    .enumerate()
    {
        let id = 0x4000 + u16::try_from(index).expect("small index");
        stats.record(
            &format!("dns {name}"),
            check_dns_hijack(&args, id, name),
            args.verbose,
        );
    }
    stats.record("dns AAAA passthrough", check_dns_non_a(&args, 0x4FFF), args.verbose);

    // Probe routing: every table row answers with its response class
    for &(path, action) in PROBE_ROUTES {
        stats.record(
            &format!("probe {path}"),
            check_probe_path(&args, &expected_url, path, action),
            args.verbose,
        );
    }

    stats.record("portal root", check_portal_root(&args), args.verbose);
    stats.record(
        "captive agent redirect",
        check_captive_agent_redirect(&args, &expected_url),
        args.verbose,
    );
    stats.record(
        "foreign root not index",
        check_foreign_root_not_index(&args),
        args.verbose,
    );

    stats.print_summary();
    if stats.failed > 0 {
        std::process::exit(1);
    }
}
