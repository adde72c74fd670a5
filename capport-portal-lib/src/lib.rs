//! Captive-portal policy for capport
//!
//! The probe classification table, redirect construction, Host and
//! User-Agent matching, and the asset MIME map. This crate is
//! hardware-agnostic: the firmware registers HTTP handlers from the table
//! and executes the routing decisions computed here, so the interception
//! behaviour can be tested without a device.

use serde::{Deserialize, Serialize};

/// Marker that Apple's captive network assistant puts in its User-Agent.
pub const CAPTIVE_UA_MARKER: &str = "CaptiveNetworkSupport";

/// How a recognised connectivity probe must be answered for the issuing
/// OS to conclude it is behind a captive portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// `200 OK` with a meta-refresh HTML body. Some probers treat any
    /// 2xx as "captive" and open the browser on the returned document.
    ServeRedirectHtml,
    /// `302 Found` with a `Location` header and empty body.
    Redirect,
}

/// Known connectivity-probe paths and the response each OS expects.
///
/// Exact path match, case-sensitive. This table IS the routing table:
/// the firmware registers one handler per row. The classification per
/// path reflects observed OS behaviour and must stay stable.
pub const PROBE_ROUTES: &[(&str, ProbeAction)] = &[
    ("/mobile/status.php", ProbeAction::ServeRedirectHtml), // Android 8.0 (Samsung S9+)
    ("/generate_204", ProbeAction::ServeRedirectHtml),      // Android
    ("/gen_204", ProbeAction::Redirect),                    // Android 9.0
    ("/ncsi.txt", ProbeAction::Redirect),                   // Windows
    ("/success.txt", ProbeAction::Redirect),                // macOS
    ("/hotspot-detect.html", ProbeAction::Redirect),        // iOS 8/9
    ("/hotspotdetect.html", ProbeAction::Redirect),         // iOS 8/9
    ("/library/test/success.html", ProbeAction::Redirect),  // iOS 8/9
    ("/kindle-wifi/wifistub.html", ProbeAction::Redirect),  // Kindle
];

/// Look up a path in the probe table.
#[must_use]
pub fn classify_probe(path: &str) -> Option<ProbeAction> {
    PROBE_ROUTES
        .iter()
        .find(|(probe_path, _)| *probe_path == path)
        .map(|(_, action)| *action)
}

/// Canonical portal URL: `{scheme}://{hostname}`, no path or query.
/// The scheme is `https` iff a TLS certificate is installed.
#[must_use]
pub fn redirect_url(hostname: &str, ssl_enabled: bool) -> String {
    let scheme = if ssl_enabled { "https" } else { "http" };
    format!("{scheme}://{hostname}")
}

/// Meta-refresh document served for [`ProbeAction::ServeRedirectHtml`].
#[must_use]
pub fn redirect_html(url: &str) -> String {
    format!(
        "<head><meta http-equiv='refresh' content='0; url={url}'></head>\
         <body><p>Click <a href='{url}'>here</a> to login.</p></body>\r\n"
    )
}

/// Whether a Host header names the portal.
///
/// Lowercases, strips a `:port` suffix, then requires an exact match.
/// A plain substring search would also accept
/// `setup.device.local.attacker.com`.
#[must_use]
pub fn host_matches(host_header: &str, portal_hostname: &str) -> bool {
    let host = host_header.to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or("");
    host == portal_hostname.to_ascii_lowercase()
}

/// Whether a User-Agent belongs to a captive-portal probe agent.
/// Substring match; the marker appears inside a longer product string.
#[must_use]
pub fn wants_captive_support(user_agent: &str) -> bool {
    user_agent.contains(CAPTIVE_UA_MARKER)
}

/// Whether an Accept-Encoding header permits gzip transfer encoding.
#[must_use]
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.contains("gzip")
}

/// Whether a request path names a pre-compressed asset.
#[must_use]
pub fn is_gzip_path(path: &str) -> bool {
    path.ends_with(".gz")
}

/// Extension to content-type map. Longest-suffix rows first so the
/// pre-compressed forms win over their base extensions.
const MIME_TYPES: &[(&str, &str)] = &[
    (".html.gz", "text/html; charset=utf-8"),
    (".js.gz", "application/javascript; charset=utf-8"),
    (".css.gz", "text/css; charset=utf-8"),
    (".html", "text/html"),
    (".js", "application/javascript"),
    (".css", "text/css"),
    (".json", "application/json"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".svg", "image/svg+xml"),
    (".ico", "image/x-icon"),
    (".txt", "text/plain"),
];

/// Content type for an asset path, by extension.
#[must_use]
pub fn content_type_for(path: &str) -> &'static str {
    MIME_TYPES
        .iter()
        .find(|(ext, _)| path.ends_with(ext))
        .map_or("application/octet-stream", |(_, content_type)| *content_type)
}

/// Routing decision for a request that reached the root or asset handler
/// (i.e. did not match a probe path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalRoute {
    /// Host names the portal and the path is `/`: serve the index file.
    Index,
    /// Host names the portal: serve the path from the document root.
    Asset,
    /// Foreign host but a captive-probe User-Agent: 302 to the portal.
    Redirect,
    /// Foreign host: serve from the document root with default options.
    Passthrough,
}

/// Classify a non-probe request per the Host header (first) and the
/// User-Agent (second). Query strings are ignored for the `/` check.
#[must_use]
pub fn route_request(
    portal_hostname: &str,
    uri: &str,
    host: Option<&str>,
    user_agent: Option<&str>,
) -> PortalRoute {
    let path = uri.split('?').next().unwrap_or(uri);
    if host.is_some_and(|h| host_matches(h, portal_hostname)) {
        if path == "/" {
            PortalRoute::Index
        } else {
            PortalRoute::Asset
        }
    } else if user_agent.is_some_and(wants_captive_support) {
        PortalRoute::Redirect
    } else {
        PortalRoute::Passthrough
    }
}

/// Portal configuration, persisted by the firmware alongside the rest of
/// the device config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    /// Start the portal automatically at boot.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Hostname the portal answers to and redirects probes toward.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Index file served for `/`, relative to the document root.
    #[serde(default = "default_index_file")]
    pub index_file: String,
    /// Filesystem root the asset server reads from.
    #[serde(default = "default_document_root")]
    pub document_root: String,
}

fn default_enable() -> bool {
    true
}

fn default_hostname() -> String {
    "setup.device.local".to_string()
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_document_root() -> String {
    "/www".to_string()
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            hostname: default_hostname(),
            index_file: default_index_file(),
            document_root: default_document_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_table_classification_is_stable() {
        // Response class per path is empirical OS behaviour; a change
        // here must be deliberate.
        let expected = [
            ("/mobile/status.php", ProbeAction::ServeRedirectHtml),
            ("/generate_204", ProbeAction::ServeRedirectHtml),
            ("/gen_204", ProbeAction::Redirect),
            ("/ncsi.txt", ProbeAction::Redirect),
            ("/success.txt", ProbeAction::Redirect),
            ("/hotspot-detect.html", ProbeAction::Redirect),
            ("/hotspotdetect.html", ProbeAction::Redirect),
            ("/library/test/success.html", ProbeAction::Redirect),
            ("/kindle-wifi/wifistub.html", ProbeAction::Redirect),
        ];
        assert_eq!(PROBE_ROUTES.len(), expected.len());
        for (path, action) in expected {
            assert_eq!(classify_probe(path), Some(action), "path {path}");
        }
    }

    #[test]
    fn unknown_paths_not_classified() {
        assert_eq!(classify_probe("/"), None);
        assert_eq!(classify_probe("/index.html"), None);
        // exact match, no prefix or case slack
        assert_eq!(classify_probe("/generate_204/extra"), None);
        assert_eq!(classify_probe("/Generate_204"), None);
    }

    #[test]
    fn redirect_url_scheme_follows_tls() {
        assert_eq!(redirect_url("setup.device.local", false), "http://setup.device.local");
        assert_eq!(redirect_url("setup.device.local", true), "https://setup.device.local");
    }

    #[test]
    fn redirect_html_body() {
        let html = redirect_html("http://setup.device.local");
        assert!(html.contains("meta http-equiv='refresh' content='0; url=http://setup.device.local'"));
        assert!(html.contains("<a href='http://setup.device.local'>here</a>"));
    }

    #[test]
    fn host_matching_is_exact() {
        assert!(host_matches("setup.device.local", "setup.device.local"));
        assert!(host_matches("setup.device.local:80", "setup.device.local"));
        assert!(host_matches("SETUP.Device.Local", "setup.device.local"));
        // substring lookalikes must not match
        assert!(!host_matches("setup.device.local.attacker.com", "setup.device.local"));
        assert!(!host_matches("notsetup.device.local", "setup.device.local"));
        assert!(!host_matches("example.com", "setup.device.local"));
        assert!(!host_matches("", "setup.device.local"));
    }

    #[test]
    fn captive_user_agent_detected() {
        assert!(wants_captive_support("CaptiveNetworkSupport-355.200.10 wispr"));
        assert!(!wants_captive_support("Mozilla/5.0 (iPhone; CPU iPhone OS 15_0)"));
    }

    #[test]
    fn gzip_negotiation() {
        assert!(accepts_gzip("gzip, deflate"));
        assert!(accepts_gzip("br;q=1.0, gzip;q=0.8"));
        assert!(!accepts_gzip("identity"));
        assert!(is_gzip_path("/app.min.js.gz"));
        assert!(!is_gzip_path("/app.min.js"));
    }

    #[test]
    fn content_types_for_compressed_assets() {
        assert_eq!(content_type_for("/portal.html.gz"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("/app.js.gz"), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for("/style.css.gz"), "text/css; charset=utf-8");
        assert_eq!(content_type_for("/portal.html"), "text/html");
        assert_eq!(content_type_for("/data.bin"), "application/octet-stream");
    }

    #[test]
    fn routing_gates_on_host_then_user_agent() {
        let hostname = "setup.device.local";

        // Portal host serves the index at the root only.
        assert_eq!(
            route_request(hostname, "/", Some("setup.device.local"), None),
            PortalRoute::Index
        );
        assert_eq!(
            route_request(hostname, "/?forward=1", Some("setup.device.local:80"), None),
            PortalRoute::Index
        );
        assert_eq!(
            route_request(hostname, "/app.js.gz", Some("setup.device.local"), None),
            PortalRoute::Asset
        );

        // Foreign host with a captive UA is redirected, otherwise passed
        // through; the index file is never served for a foreign host.
        assert_eq!(
            route_request(hostname, "/", Some("example.com"), Some("CaptiveNetworkSupport-355 wispr")),
            PortalRoute::Redirect
        );
        assert_eq!(
            route_request(hostname, "/", Some("example.com"), Some("Mozilla/5.0")),
            PortalRoute::Passthrough
        );
        assert_eq!(route_request(hostname, "/", None, None), PortalRoute::Passthrough);
    }

    #[test]
    fn settings_defaults() {
        let settings = PortalSettings::default();
        assert!(settings.enable);
        assert_eq!(settings.hostname, "setup.device.local");
        assert_eq!(settings.index_file, "index.html");
        assert_eq!(settings.document_root, "/www");
    }
}
