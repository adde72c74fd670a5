//! Named FreeRTOS threads and task-watchdog registration.
//!
//! `std::thread::Builder::name()` renames the pthread after creation, but
//! ESP-IDF bakes the FreeRTOS task name in at spawn time, so long-running
//! threads are spawned through `ThreadSpawnConfiguration` here. The same
//! threads register with the Task Watchdog Timer and must feed it within
//! its timeout (5 s by default).

use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::sys::{
    esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t,
};
use log::{debug, error};
use std::ffi::CStr;
use std::thread::JoinHandle;

/// Spawn a thread whose FreeRTOS task carries `name`.
///
/// Task names are limited to 16 bytes including the null terminator.
pub fn spawn_named<F, T>(name: &'static CStr, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let prev_conf = ThreadSpawnConfiguration::get();

    let conf = ThreadSpawnConfiguration {
        name: Some(name.to_bytes_with_nul()),
        ..Default::default()
    };
    conf.set()
        .expect("Failed to set thread spawn configuration");

    let handle = std::thread::spawn(f);

    // Restore so unrelated spawns don't inherit our task name
    if let Some(prev) = prev_conf {
        prev.set()
            .expect("Failed to restore thread spawn configuration");
    }

    handle
}

/// A registered watchdog user. Unregisters on drop.
pub struct WatchdogHandle {
    handle: esp_task_wdt_user_handle_t,
    name: &'static CStr,
}

impl WatchdogHandle {
    /// Register a watchdog user under `name`.
    ///
    /// # Panics
    /// Panics if registration fails (critical system error).
    pub fn register(name: &'static CStr) -> Self {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();

        let result = unsafe { esp_task_wdt_add_user(name.as_ptr(), &mut handle) };

        assert!(
            result == 0,
            "Watchdog: failed to register user '{name:?}': error code {result}"
        );
        debug!("Watchdog: registered user '{name:?}'");
        Self { handle, name }
    }

    /// Feed the watchdog; must be called within the watchdog timeout.
    pub fn feed(&self) {
        let result = unsafe { esp_task_wdt_reset_user(self.handle) };
        if result != 0 {
            error!("Watchdog: failed to feed '{:?}'", self.name);
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        debug!("Watchdog: unregistering user '{:?}'", self.name);
        let result = unsafe { esp_task_wdt_delete_user(self.handle) };
        if result != 0 {
            error!(
                "Watchdog: failed to unregister '{:?}': error code {result}",
                self.name
            );
        }
    }
}
