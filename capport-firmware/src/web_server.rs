//! Captive portal HTTP layer.
//!
//! Three kinds of endpoint: the probe routes from the classification
//! table, the portal root (index file), and the wildcard asset fallback.
//! The policy decisions all live in `capport-portal-lib`; handlers here
//! only execute them against the filesystem and the connection.

use anyhow::Result;
use capport_portal_lib::{
    accepts_gzip, content_type_for, is_gzip_path, redirect_html, redirect_url, route_request,
    PortalRoute, ProbeAction, PROBE_ROUTES,
};
use embedded_svc::http::Method;
use embedded_svc::io::Write;
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::io::EspIOError;
use log::{debug, info};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;

/// Immutable runtime view of the portal configuration, snapshotted once
/// at start. Every handler holds an `Arc` to the same snapshot.
pub struct PortalContext {
    pub hostname: String,
    pub index_file: String,
    pub document_root: PathBuf,
    /// Precomputed `{scheme}://{hostname}`; the scheme never changes
    /// after start because the config snapshot is immutable.
    pub redirect_url: String,
}

impl PortalContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            redirect_url: redirect_url(&config.portal.hostname, config.ssl_enabled()),
            hostname: config.portal.hostname.clone(),
            index_file: config.portal.index_file.clone(),
            document_root: PathBuf::from(&config.portal.document_root),
        }
    }
}

/// Create the HTTP server and register all portal routes.
///
/// Registration order matters with wildcard matching enabled: probe
/// paths first, then `/`, then the `/*` fallback.
pub fn start(ctx: &Arc<PortalContext>) -> Result<EspHttpServer<'static>> {
    // Bounded sockets with LRU purge: captive-portal browsers disconnect
    // abruptly and would otherwise pin sockets until timeout
    let server_config = Configuration {
        uri_match_wildcard: true,
        max_uri_handlers: 16,
        max_open_sockets: 6,
        session_timeout: core::time::Duration::from_secs(2),
        lru_purge_enable: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&server_config)?;

    // Probe endpoints: the classification table is the routing table
    for &(path, action) in PROBE_ROUTES {
        let ctx = Arc::clone(ctx);
        server.fn_handler(path, Method::Get, move |req| -> Result<(), EspIOError> {
            match action {
                ProbeAction::ServeRedirectHtml => {
                    info!("Serving redirect HTML to {} for captive portal", ctx.redirect_url);
                    serve_redirect_html(req, &ctx.redirect_url)
                }
                ProbeAction::Redirect => {
                    info!("Redirecting to {} for captive portal", ctx.redirect_url);
                    send_redirect(req, &ctx.redirect_url)
                }
            }
        })?;
    }

    // Portal root: index file when the Host header names the portal
    {
        let ctx = Arc::clone(ctx);
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            handle_portal_request(req, &ctx)
        })?;
    }

    // Everything else: assets for the portal host, probe fallback for the
    // rest. Must be registered last, it matches every URI.
    {
        let ctx = Arc::clone(ctx);
        server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
            handle_portal_request(req, &ctx)
        })?;
    }

    info!(
        "HTTP routes registered ({} probe endpoints + root + fallback)",
        PROBE_ROUTES.len()
    );
    Ok(server)
}

/// Root and wildcard handler: gate on Host, then User-Agent.
fn handle_portal_request(
    req: Request<&mut EspHttpConnection<'_>>,
    ctx: &PortalContext,
) -> Result<()> {
    let uri = req.uri().to_string();
    let host = req.header("Host").map(str::to_string);
    let user_agent = req.header("User-Agent").map(str::to_string);

    debug!("HTTP: GET {uri} (host: {host:?})");

    let route = route_request(&ctx.hostname, &uri, host.as_deref(), user_agent.as_deref());
    let path = uri.split('?').next().unwrap_or("/").to_string();

    match route {
        PortalRoute::Index => serve_index(req, ctx),
        PortalRoute::Redirect => {
            info!("Captive probe agent on foreign host, redirecting to {}", ctx.redirect_url);
            send_redirect(req, &ctx.redirect_url)?;
            Ok(())
        }
        // The gzip transfer convention only applies on the portal host;
        // passthrough serving uses default options.
        PortalRoute::Asset => serve_asset(req, ctx, &path, true),
        PortalRoute::Passthrough => serve_asset(req, ctx, &path, false),
    }
}

/// Serve the portal index, preferring a pre-compressed sibling when the
/// client accepts gzip.
fn serve_index(req: Request<&mut EspHttpConnection<'_>>, ctx: &PortalContext) -> Result<()> {
    let index_path = ctx.document_root.join(&ctx.index_file);
    let gzip_path = ctx.document_root.join(format!("{}.gz", ctx.index_file));

    let client_accepts_gzip = req
        .header("Accept-Encoding")
        .is_some_and(accepts_gzip);

    if client_accepts_gzip && gzip_path.is_file() {
        debug!("Serving pre-compressed portal index");
        serve_file(
            req,
            &gzip_path,
            "text/html",
            &[("Content-Encoding", "gzip")],
        )
    } else {
        debug!("Serving portal index");
        serve_file(
            req,
            &index_path,
            "text/html",
            &[("Access-Control-Allow-Origin", "*")],
        )
    }
}

/// Serve a file from the document root with the configured MIME mapping.
fn serve_asset(
    req: Request<&mut EspHttpConnection<'_>>,
    ctx: &PortalContext,
    path: &str,
    gzip_convention: bool,
) -> Result<()> {
    // No parent traversal out of the document root
    if path.split('/').any(|segment| segment == "..") {
        req.into_status_response(404)?;
        return Ok(());
    }

    let file_path = ctx.document_root.join(path.trim_start_matches('/'));
    let content_type = content_type_for(path);

    if gzip_convention && is_gzip_path(path) {
        serve_file(
            req,
            &file_path,
            content_type,
            &[
                ("Content-Encoding", "gzip"),
                ("Access-Control-Allow-Origin", "*"),
            ],
        )
    } else {
        serve_file(
            req,
            &file_path,
            content_type,
            &[("Access-Control-Allow-Origin", "*")],
        )
    }
}

/// Stream a file to the client, or 404 if it is not a regular file.
fn serve_file(
    req: Request<&mut EspHttpConnection<'_>>,
    file_path: &std::path::Path,
    content_type: &str,
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    if !file_path.is_file() {
        debug!("Asset not found: {}", file_path.display());
        req.into_status_response(404)?;
        return Ok(());
    }
    let Ok(mut file) = fs::File::open(file_path) else {
        req.into_status_response(404)?;
        return Ok(());
    };

    let content_length = file.metadata()?.len().to_string();
    let mut headers: Vec<(&str, &str)> = vec![
        ("Content-Type", content_type),
        ("Content-Length", content_length.as_str()),
    ];
    headers.extend_from_slice(extra_headers);

    let mut response = req.into_response(200, Some("OK"), &headers)?;

    let mut chunk = [0u8; 1024];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        response.write_all(&chunk[..read])?;
    }
    Ok(())
}

/// `200 OK` with the meta-refresh document; what HTML-expecting probers
/// need to open the sign-in browser.
fn serve_redirect_html(
    req: Request<&mut EspHttpConnection<'_>>,
    url: &str,
) -> Result<(), EspIOError> {
    let body = redirect_html(url);
    let content_length = body.len().to_string();
    let mut response = req.into_response(
        200,
        Some("OK"),
        &[
            ("Content-Type", "text/html"),
            ("Content-Length", content_length.as_str()),
            ("Cache-Control", "no-cache"),
        ],
    )?;
    response.write_all(body.as_bytes())?;
    Ok(())
}

/// `302 Found` to the canonical portal URL, empty body.
fn send_redirect(req: Request<&mut EspHttpConnection<'_>>, url: &str) -> Result<(), EspIOError> {
    req.into_response(
        302,
        Some("Found"),
        &[("Location", url), ("Cache-Control", "no-cache")],
    )?;
    Ok(())
}
