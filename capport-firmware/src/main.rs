use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::modem::Modem;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::ipv4;
use esp_idf_svc::mdns::EspMdns;
use esp_idf_svc::netif::{EspNetif, NetifConfiguration, NetifStack};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration, EspWifi, WifiDriver,
};
use log::{info, warn};
use std::ffi::CString;
use std::net::Ipv4Addr;

mod config;
mod dns;
mod lifecycle;
mod tasks;
mod web_server;

use config::Config;

/// Create the AP network interface for the captive portal.
///
/// The DHCP server must hand out our address as both gateway and DNS
/// (the default router config points clients at 8.8.8.8, which bypasses
/// the hijacker entirely).
fn create_ap_netif(ap_ip: Ipv4Addr, prefix_len: u8) -> Result<EspNetif> {
    let router_config = ipv4::RouterConfiguration {
        subnet: ipv4::Subnet {
            gateway: ap_ip,
            mask: ipv4::Mask(prefix_len),
        },
        dhcp_enabled: true,
        dns: Some(ap_ip),
        secondary_dns: Some(ap_ip),
    };

    let mut netif_config = NetifConfiguration::wifi_default_router();
    netif_config.ip_configuration = Some(ipv4::Configuration::Router(router_config));
    Ok(EspNetif::new_with_conf(&netif_config)?)
}

/// Mount the SPIFFS partition holding the portal UI assets.
fn mount_assets(document_root: &str) -> Result<()> {
    use esp_idf_svc::sys;

    let base_path = CString::new(document_root)?;
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: std::ptr::null(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    // SAFETY: conf and base_path stay alive for the duration of the call
    sys::esp!(unsafe { sys::esp_vfs_spiffs_register(&conf) })?;

    info!("Portal assets mounted at {document_root}");
    Ok(())
}

/// Start WiFi as an open (or WPA2, if a password is configured) access
/// point on the portal's fixed IP.
fn start_ap(
    modem: Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    config: &Config,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    let wifi_driver = WifiDriver::new(modem, sysloop.clone(), Some(nvs))?;

    let ap_netif = create_ap_netif(config.ap_ip, config.ap_prefix_len)?;
    // STA netif is unused in AP mode, but wrap_all requires one
    let sta_netif = EspNetif::new(NetifStack::Sta)?;

    let wifi = EspWifi::wrap_all(wifi_driver, sta_netif, ap_netif)?;
    let mut wifi = BlockingWifi::wrap(wifi, sysloop)?;

    let ap_password = config.ap_password.clone().unwrap_or_default();
    let auth_method = if ap_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    info!("Starting WiFi AP '{}'", config.ap_ssid);
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config.ap_ssid.as_str().try_into().unwrap_or_default(),
        password: ap_password.as_str().try_into().unwrap_or_default(),
        auth_method,
        channel: 1,
        max_connections: 4,
        ..Default::default()
    }))?;
    wifi.start()?;

    Ok(wifi)
}

/// Advertise the portal hostname's first label over mDNS so clients can
/// also reach the device at `{label}.local` once they are through setup.
fn setup_mdns(hostname: &str) -> Option<EspMdns> {
    let label = hostname.split('.').next().unwrap_or(hostname);
    match EspMdns::take() {
        Ok(mut mdns) => {
            let _ = mdns.set_hostname(label);
            let _ = mdns.set_instance_name("Device Setup Portal");
            let _ = mdns.add_service(None, "_http", "_tcp", 80, &[]);
            info!("mDNS started: {label}.local");
            Some(mdns)
        }
        Err(e) => {
            warn!("Failed to start mDNS: {e:?}");
            None
        }
    }
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting capport firmware...");

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Initialize NVS for config storage
    config::init_nvs(nvs.clone())?;
    let config = Config::load_or_default();

    // Apply configured log level
    {
        let level = config.log_level.as_level_filter();
        if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
            warn!("Failed to set log level: {e}");
        } else {
            info!("Log level set to {:?}", config.log_level);
        }
    }

    // Portal UI assets; a missing partition only costs asset 404s later
    if let Err(e) = mount_assets(&config.portal.document_root) {
        warn!("Failed to mount asset filesystem: {e}");
    }

    let wifi = start_ap(peripherals.modem, sysloop, nvs, &config)?;
    let ap_ip_info = wifi.wifi().ap_netif().get_ip_info()?;
    info!(
        "AP started - connect to '{}' and navigate to http://{}",
        config.ap_ssid, ap_ip_info.ip
    );

    // mDNS for local discovery once the client is through setup
    let _mdns = setup_mdns(&config.portal.hostname);

    // DNS hijacker + HTTP routes, gated on the boot-time enable flag
    lifecycle::init_from_config(&config);

    // Keep WiFi and mDNS alive; all request work happens on the DNS
    // thread and the httpd task
    let _wifi = wifi;
    loop {
        FreeRtos::delay_ms(1000);
    }
}
