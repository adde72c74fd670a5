//! Captive portal lifecycle.
//!
//! One-shot startup guard around the DNS responder and the HTTP routes.
//! The portal starts at most once per boot; the config snapshot taken at
//! start is immutable for the process lifetime.

use atomic_enum::atomic_enum;
use derive_more::{Display, Error, From};
use log::{error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::Config;
use crate::{dns, web_server};

#[atomic_enum]
#[derive(PartialEq)]
pub enum PortalState {
    Stopped,
    Started,
}

static STATE: AtomicPortalState = AtomicPortalState::new(PortalState::Stopped);

/// Why `start` refused or failed. Nothing here is fatal to the process.
#[derive(Debug, Display, Error, From)]
pub enum StartError {
    /// `start` was called while the portal is already running.
    #[display("captive portal already started")]
    AlreadyStarted,
    /// The UDP :53 bind failed; no HTTP route was registered.
    #[display("DNS listener bind failed: {_0}")]
    DnsBind(#[error(source)] std::io::Error),
    /// HTTP server creation or route registration failed.
    #[display("HTTP server setup failed: {_0}")]
    Http(#[error(not(source))] anyhow::Error),
}

/// Start the captive portal: bind DNS, then register the HTTP routes.
///
/// Ordering is deliberate: a failed DNS bind returns before any HTTP
/// route exists, and `Started` is only observable after both succeeded.
/// A second call is rejected without side effects.
///
/// # Errors
///
/// [`StartError::AlreadyStarted`] on re-entry, otherwise the underlying
/// bind or registration error.
pub fn start(config: &Config) -> Result<(), StartError> {
    if STATE.load(Ordering::SeqCst) == PortalState::Started {
        error!("Captive portal already started, ignoring start request");
        return Err(StartError::AlreadyStarted);
    }

    info!("Starting captive portal...");

    // Immutable snapshot shared by every handler
    let ctx = Arc::new(web_server::PortalContext::from_config(config));

    // DNS first: its bind failure must leave no HTTP routes behind
    dns::start_dns_server(config.ap_ip)?;

    let server = web_server::start(&ctx).map_err(StartError::Http)?;

    // The server runs until reboot; handlers keep their Arc snapshots
    std::mem::forget(server);

    STATE.store(PortalState::Started, Ordering::SeqCst);
    info!("Captive portal running, redirect target {}", ctx.redirect_url);
    Ok(())
}

/// Boot-time initialiser: start the portal when the config enables it.
/// Failure to start is logged but never propagated.
pub fn init_from_config(config: &Config) {
    if !config.portal.enable {
        info!("Captive portal disabled in config");
        return;
    }
    if let Err(e) = start(config) {
        error!("Captive portal startup failed: {e}");
    }
}
