//! Pluggable shell and environment policies.
//!
//! Session spawn delegates four decisions to trait objects: which shell
//! binary to run, what extra environment to hand it, which argv to use, and
//! how to materialize shell-init files when PATH entries must be prepended.
//! Hosts swap these to integrate editor toolchains; the defaults give a
//! plain login shell.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable naming the PATH elements the init files prepend.
pub const PATH_PREPEND_VAR: &str = "FLOETERM_PATH_PREPEND";
/// Saved original ZDOTDIR so a nested zsh can chain to the user's dotfiles.
pub const ORIGINAL_ZDOTDIR_VAR: &str = "FLOETERM_ORIGINAL_ZDOTDIR";

pub trait ShellResolver: Send + Sync {
    /// Path of the shell binary to spawn.
    fn resolve(&self) -> PathBuf;
}

/// Environment produced for a new shell.
#[derive(Debug, Clone, Default)]
pub struct ShellEnv {
    pub vars: Vec<(String, String)>,
    /// PATH elements to put in front of the user's PATH. Non-empty triggers
    /// shell-init file generation.
    pub path_prepend: Vec<String>,
}

pub trait EnvProvider: Send + Sync {
    fn build(&self) -> ShellEnv;
}

/// Argv and extra environment for the shell invocation.
#[derive(Debug, Clone, Default)]
pub struct ShellArgs {
    pub args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
}

pub trait ShellArgsProvider: Send + Sync {
    /// `None` means "no opinion" and the session falls back to `-l`.
    /// `Some` with an empty `args` runs the shell with no argv at all —
    /// zsh's ZDOTDIR strategy depends on that distinction.
    fn args_for(&self, shell: &Path) -> Option<ShellArgs>;
}

pub trait ShellInitWriter: Send + Sync {
    /// Materialize rc files for the given PATH prepend. Returns extra
    /// environment (e.g. `ZDOTDIR`) to set on the child.
    fn write_init_files(&self, path_prepend: &[String]) -> io::Result<Vec<(String, String)>>;
}

/// The four policies a session spawn consults, bundled.
#[derive(Clone)]
pub struct ShellPolicy {
    pub resolver: Arc<dyn ShellResolver>,
    pub env: Arc<dyn EnvProvider>,
    pub args: Arc<dyn ShellArgsProvider>,
    pub init_writer: Arc<dyn ShellInitWriter>,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self {
            resolver: Arc::new(DefaultShellResolver),
            env: Arc::new(DefaultEnvProvider),
            args: Arc::new(DefaultShellArgsProvider),
            init_writer: Arc::new(ZdotdirInitWriter::default()),
        }
    }
}

/// `$SHELL`, falling back to `/bin/bash`.
pub struct DefaultShellResolver;

impl ShellResolver for DefaultShellResolver {
    fn resolve(&self) -> PathBuf {
        std::env::var("SHELL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/bin/bash"))
    }
}

/// No extra environment, no PATH prepend.
pub struct DefaultEnvProvider;

impl EnvProvider for DefaultEnvProvider {
    fn build(&self) -> ShellEnv {
        ShellEnv::default()
    }
}

/// No opinion on argv; every shell gets the `-l` fallback.
pub struct DefaultShellArgsProvider;

impl ShellArgsProvider for DefaultShellArgsProvider {
    fn args_for(&self, _shell: &Path) -> Option<ShellArgs> {
        None
    }
}

/// Fixed shell path, for hosts (and tests) that pin the binary.
pub struct StaticShellResolver(pub PathBuf);

impl ShellResolver for StaticShellResolver {
    fn resolve(&self) -> PathBuf {
        self.0.clone()
    }
}

/// Fixed argv, for hosts (and tests) that pin the invocation.
pub struct StaticShellArgsProvider(pub Vec<String>);

impl ShellArgsProvider for StaticShellArgsProvider {
    fn args_for(&self, _shell: &Path) -> Option<ShellArgs> {
        Some(ShellArgs {
            args: self.0.clone(),
            extra_env: Vec::new(),
        })
    }
}

/// Writes a ZDOTDIR whose `.zshrc` prepends PATH and then chains to the
/// user's original dotfiles.
pub struct ZdotdirInitWriter {
    root: PathBuf,
}

impl Default for ZdotdirInitWriter {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("floeterm-zdotdir"),
        }
    }
}

impl ZdotdirInitWriter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ShellInitWriter for ZdotdirInitWriter {
    fn write_init_files(&self, path_prepend: &[String]) -> io::Result<Vec<(String, String)>> {
        std::fs::create_dir_all(&self.root)?;
        let zshrc = concat!(
            "export PATH=\"$FLOETERM_PATH_PREPEND:$PATH\"\n",
            "if [ -n \"$FLOETERM_ORIGINAL_ZDOTDIR\" ]; then\n",
            "  ZDOTDIR=\"$FLOETERM_ORIGINAL_ZDOTDIR\"\n",
            "else\n",
            "  ZDOTDIR=\"$HOME\"\n",
            "fi\n",
            "[ -f \"$ZDOTDIR/.zshrc\" ] && . \"$ZDOTDIR/.zshrc\"\n",
        );
        std::fs::write(self.root.join(".zshrc"), zshrc)?;

        let mut vars = vec![
            ("ZDOTDIR".to_string(), self.root.display().to_string()),
            (PATH_PREPEND_VAR.to_string(), path_prepend.join(":")),
        ];
        if let Ok(original) = std::env::var("ZDOTDIR") {
            if !original.is_empty() {
                vars.push((ORIGINAL_ZDOTDIR_VAR.to_string(), original));
            }
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resolver_prefers_shell_env() {
        // Only shape-check the fallback path: resolve never panics and
        // returns something absolute-ish.
        let shell = DefaultShellResolver.resolve();
        assert!(!shell.as_os_str().is_empty());
    }

    #[test]
    fn zdotdir_writer_materializes_rc_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ZdotdirInitWriter::new(dir.path().join("zdot"));
        let vars = writer
            .write_init_files(&["/opt/tools/bin".to_string(), "/opt/extra".to_string()])
            .expect("write init files");

        let rc = std::fs::read_to_string(dir.path().join("zdot").join(".zshrc"))
            .expect("read zshrc");
        assert!(rc.contains("$FLOETERM_PATH_PREPEND"));
        assert!(rc.contains("$FLOETERM_ORIGINAL_ZDOTDIR"));

        let zdot = vars.iter().find(|(k, _)| k == "ZDOTDIR").expect("ZDOTDIR var");
        assert_eq!(zdot.1, dir.path().join("zdot").display().to_string());
        let prepend = vars
            .iter()
            .find(|(k, _)| k == PATH_PREPEND_VAR)
            .expect("prepend var");
        assert_eq!(prepend.1, "/opt/tools/bin:/opt/extra");
    }
}
