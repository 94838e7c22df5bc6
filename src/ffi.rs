//! C ABI entry points
//!
//! ```c
//! void  solvertray_init(const char* flags, void (*callback)(const char*));
//! void* solvertray_create(void);
//! bool  solvertray_send(void* context, const char* command, unsigned int size, void* data);
//! void  solvertray_destroy(void* context);
//! ```
//!
//! Panics never cross this boundary; they become the call's failure value.

use std::ffi::CStr;
use std::os::raw::{c_char, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::buffer::Buffer;
use crate::logging::{self, LogCallback};
use crate::runtime::{self, EnvDevices};
use crate::session::Session;

/// Initialize logging and device selection.
///
/// # Safety
/// `flags` must be null or a valid NUL-terminated string. `callback` must be
/// null or callable with a NUL-terminated string from any thread.
#[no_mangle]
pub unsafe extern "C" fn solvertray_init(flags: *const c_char, callback: Option<LogCallback>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        logging::install(callback);
        let spec = if flags.is_null() {
            String::new()
        } else {
            CStr::from_ptr(flags).to_string_lossy().into_owned()
        };
        runtime::initialize(&spec, &EnvDevices);
    }));
    if result.is_err() {
        log::error!("panic during solvertray_init");
    }
}

/// Create a session. Returns null on failure.
#[no_mangle]
pub extern "C" fn solvertray_create() -> *mut c_void {
    match panic::catch_unwind(|| Box::new(Session::new())) {
        Ok(session) => Box::into_raw(session).cast::<c_void>(),
        Err(_) => ptr::null_mut(),
    }
}

/// Run one command against a session.
///
/// # Safety
/// `context` must be null or a handle from `solvertray_create` not yet
/// destroyed, and not used concurrently. `command` must be null or a valid
/// NUL-terminated string. `data` must be null or valid for reads and writes
/// of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn solvertray_send(
    context: *mut c_void,
    command: *const c_char,
    size: c_uint,
    data: *mut c_void,
) -> bool {
    if context.is_null() || command.is_null() {
        return false;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let session = &mut *context.cast::<Session>();
        let command = match CStr::from_ptr(command).to_str() {
            Ok(command) => command,
            Err(_) => {
                log::debug!("Rejected command that is not valid UTF-8");
                return false;
            }
        };
        let mut buffer = Buffer::from_raw(size, data);
        session.send(command, &mut buffer)
    }));

    result.unwrap_or_else(|_| {
        log::error!("panic while executing command");
        false
    })
}

/// Release a session and everything it owns. Null is a no-op.
///
/// # Safety
/// `context` must be null or a handle from `solvertray_create` that has not
/// been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn solvertray_destroy(context: *mut c_void) {
    if context.is_null() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        drop(Box::from_raw(context.cast::<Session>()));
    }));
    if result.is_err() {
        log::error!("panic while destroying session");
    }
}
