// Cross-platform command utilities
// Helpers for spawning subprocesses without flashing a console window on
// Windows.

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Extension trait for tokio Command to hide the console window on
/// Windows. A no-op elsewhere.
pub trait TokioCommandExt {
    fn hide_window(&mut self) -> &mut Self;
}

impl TokioCommandExt for tokio::process::Command {
    #[cfg(target_os = "windows")]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW);
        self
    }

    #[cfg(not(target_os = "windows"))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

/// Create a tokio Command with the console window hidden on Windows.
pub fn hidden_command<S: AsRef<std::ffi::OsStr>>(program: S) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.hide_window();
    cmd
}
