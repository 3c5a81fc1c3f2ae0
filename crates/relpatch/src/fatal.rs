//! Process termination for unrecoverable layout and patching failures.
//!
//! Once a patch site has the wrong shape, continuing risks corrupting memory the engine
//! does not own, so every failure reaching this module ends the process.

use std::panic::Location;

use tracing::error;

use crate::error::Result;

/// Exit status used for every fatal report.
pub const EXIT_FAILURE: i32 = 1;

/// Log `message` with the caller's file and line, show it to the user, then exit.
#[track_caller]
pub fn report_and_fail(message: impl AsRef<str>) -> ! {
    let location = Location::caller();
    let body = format_report(location, message.as_ref());

    error!(
        file = location.file(),
        line = location.line(),
        "{}",
        message.as_ref()
    );
    platform::show_message(&body);

    std::process::exit(EXIT_FAILURE)
}

/// `"<path below src/>(<line>): <message>"`
pub fn format_report(location: &Location<'_>, message: &str) -> String {
    format!("{}({}): {}", short_path(location.file()), location.line(), message)
}

fn short_path(file: &str) -> &str {
    for marker in ["src/", "src\\", "include/", "include\\"] {
        if let Some(pos) = file.rfind(marker) {
            return &file[pos + marker.len()..];
        }
    }
    file
}

/// Turn an engine error into a fatal report at the call site.
pub trait OrFail<T> {
    fn or_fail(self) -> T;
}

impl<T> OrFail<T> for Result<T> {
    #[track_caller]
    fn or_fail(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => report_and_fail(e.to_string()),
        }
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::{MB_ICONERROR, MB_OK, MessageBoxW};
    use windows::core::HSTRING;

    pub fn show_message(body: &str) {
        let caption = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "relpatch".to_string());

        // SAFETY: both strings are NUL-terminated HSTRINGs alive for the call.
        unsafe {
            MessageBoxW(
                HWND::default(),
                &HSTRING::from(body),
                &HSTRING::from(caption),
                MB_OK | MB_ICONERROR,
            );
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    pub fn show_message(body: &str) {
        eprintln!("{}", body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_path_strips_source_root() {
        assert_eq!(short_path("crates/relpatch/src/offset/pattern.rs"), "offset/pattern.rs");
        assert_eq!(short_path("C:\\plugin\\src\\main.rs"), "main.rs");
        assert_eq!(short_path("build.rs"), "build.rs");
    }

    #[test]
    fn test_format_report_has_line() {
        let location = Location::caller();
        let report = format_report(location, "Pattern mismatch");
        assert!(report.ends_with("): Pattern mismatch"));
        assert!(report.contains(&format!("({})", location.line())));
    }

    #[test]
    fn test_or_fail_passes_ok_through() {
        let value: Result<u32> = Ok(7);
        assert_eq!(value.or_fail(), 7);
    }
}
