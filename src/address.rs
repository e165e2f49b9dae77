//! Bus address resolution.
//!
//! Only the `unix:path=` transport is recognized; any other address scheme is
//! rejected.

use std::env;

use crate::error::{ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const ENV_RUNTIME_DIR: &str = "XDG_USER_DIR";
const ENV_UID: &str = "UID";

const DEFAULT_SYSTEM_BUS: &str = "unix:path=/run/dbus/system_bus_socket";

/// The address of the session bus.
///
/// This uses the `DBUS_SESSION_BUS_ADDRESS` environment variable, falling
/// back to `<runtime_dir>/bus` where the runtime directory is `XDG_USER_DIR`
/// or `/run/user/<uid>`.
pub(crate) fn session_bus() -> String {
    if let Ok(address) = env::var(ENV_SESSION_BUS) {
        return address;
    }

    let runtime_dir =
        env::var(ENV_RUNTIME_DIR).unwrap_or_else(|_| format!("/run/user/{}", current_uid()));

    format!("unix:path={runtime_dir}/bus")
}

/// The address of the system bus.
///
/// This uses the `DBUS_SYSTEM_BUS_ADDRESS` environment variable, falling back
/// to the well-known address `unix:path=/run/dbus/system_bus_socket`.
pub(crate) fn system_bus() -> String {
    env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_owned())
}

/// Extract the socket path out of a `unix:path=` address.
pub(crate) fn unix_path(address: &str) -> Result<&str> {
    address
        .strip_prefix("unix:path=")
        .ok_or_else(|| ErrorKind::UnsupportedAddress.into())
}

/// The uid used for bus address resolution and authentication.
pub(crate) fn current_uid() -> u32 {
    if let Ok(uid) = env::var(ENV_UID) {
        if let Ok(uid) = uid.parse() {
            return uid;
        }
    }

    // SAFETY: getuid never fails.
    unsafe { libc::getuid() }
}
