//! Default shell resolution.

use std::path::{Path, PathBuf};

/// Well-known Git for Windows install locations.
const GIT_BASH_PATHS: &[&str] = &[
    r"C:\Program Files\Git\bin\bash.exe",
    r"C:\Program Files (x86)\Git\bin\bash.exe",
];

/// Environment variables that may point at a directory containing `Git\bin\bash.exe`.
const GIT_ROOT_VARS: &[&str] = &["GIT_INSTALL_ROOT", "ProgramFiles", "ProgramFiles(x86)"];

/// Shell basenames that understand POSIX quoting.
const POSIX_SHELLS: &[&str] = &["bash", "zsh", "sh", "fish"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Unix
        }
    }
}

/// Resolve the shell to spawn for new sessions on this host.
///
/// `$SHELL` wins when set. Otherwise Windows prefers Git Bash and falls back
/// to PowerShell; macOS uses `zsh` and everything else `bash`.
pub fn resolve() -> String {
    resolve_with(
        |key| std::env::var(key).ok(),
        Platform::current(),
        |path| path.exists(),
    )
}

/// Resolution with injectable environment, platform, and filesystem check.
pub fn resolve_with(
    env: impl Fn(&str) -> Option<String>,
    platform: Platform,
    exists: impl Fn(&Path) -> bool,
) -> String {
    if let Some(shell) = env("SHELL").filter(|s| !s.trim().is_empty()) {
        return shell;
    }

    match platform {
        Platform::Windows => find_git_bash(&env, &exists)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "powershell.exe".to_string()),
        Platform::MacOs => "zsh".to_string(),
        Platform::Unix => "bash".to_string(),
    }
}

fn find_git_bash(
    env: &impl Fn(&str) -> Option<String>,
    exists: &impl Fn(&Path) -> bool,
) -> Option<PathBuf> {
    if let Some(p) = GIT_BASH_PATHS.iter().map(PathBuf::from).find(|p| exists(p)) {
        return Some(p);
    }
    GIT_ROOT_VARS
        .iter()
        .filter_map(|key| env(key))
        .map(|dir| {
            // Joined by hand so the Windows separator survives on any host.
            let dir = dir.trim_end_matches(|c: char| c == '\\' || c == '/');
            PathBuf::from(format!(r"{dir}\Git\bin\bash.exe"))
        })
        .find(|p| exists(p))
}

/// Whether `shell_path` names a POSIX-like shell (bash, zsh, sh, fish).
pub fn is_posix_like(shell_path: &str) -> bool {
    let base = shell_path
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(shell_path)
        .to_ascii_lowercase();
    let base = base.strip_suffix(".exe").unwrap_or(&base);
    POSIX_SHELLS.contains(&base)
}
