//! Shell hook installation.
//!
//! `init` writes a marked block into the shell's rc file defining a
//! `beakerutil` function. The function points `BEAKERUTIL_SOURCE_FILE` at a
//! temp file, runs the real binary, and sources that file when the binary
//! exits with [`SOURCE_EXIT_CODE`], so commands run in the calling shell.

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const MARKER_BEGIN: &str = "# >>> beakerutil initialize >>>";
pub const MARKER_END: &str = "# <<< beakerutil initialize <<<";

/// Exit code telling the shell hook to source the written commands.
pub const SOURCE_EXIT_CODE: u8 = 3;

/// File the shell hook asks the binary to write commands into.
pub const SOURCE_FILE_ENV: &str = "BEAKERUTIL_SOURCE_FILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
}

impl Shell {
    pub fn name(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
        }
    }

    pub fn rc_file(&self, home: &Path) -> PathBuf {
        match self {
            Shell::Bash => home.join(".bashrc"),
            Shell::Zsh => home.join(".zshrc"),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_str(name, true).ok()
    }
}

/// The hook body, identical for bash and zsh.
pub fn hook_block() -> String {
    format!(
        r#"{begin}
beakerutil() {{
    local __bu_file __bu_code
    __bu_file="$(mktemp)"
    {env}="$__bu_file" command beakerutil "$@"
    __bu_code=$?
    if [ "$__bu_code" -eq {code} ]; then
        . "$__bu_file"
        __bu_code=$?
    fi
    rm -f "$__bu_file"
    return $__bu_code
}}
{end}"#,
        begin = MARKER_BEGIN,
        end = MARKER_END,
        env = SOURCE_FILE_ENV,
        code = SOURCE_EXIT_CODE,
    )
}

/// Insert `block` into `content`, replacing an existing marked block.
pub fn upsert_block(content: &str, block: &str) -> String {
    if let Some(start) = content.find(MARKER_BEGIN) {
        if let Some(end_rel) = content[start..].find(MARKER_END) {
            let end = start + end_rel + MARKER_END.len();
            return format!("{}{}{}", &content[..start], block, &content[end..]);
        }
    }
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(block);
    out.push('\n');
    out
}

/// Write the hook into the rc file. Returns whether the file changed.
pub fn install(rc_file: &Path) -> Result<bool> {
    let existing = match fs::read_to_string(rc_file) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", rc_file.display())),
    };
    let updated = upsert_block(&existing, &hook_block());
    if updated == existing {
        return Ok(false);
    }
    fs::write(rc_file, updated).with_context(|| format!("Failed to write {}", rc_file.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_appends_once() {
        let block = hook_block();
        let once = upsert_block("export PATH=/bin", &block);
        assert!(once.starts_with("export PATH=/bin\n\n# >>> beakerutil"));
        let twice = upsert_block(&once, &block);
        assert_eq!(once, twice);
        assert_eq!(twice.matches(MARKER_BEGIN).count(), 1);
    }

    #[test]
    fn test_upsert_replaces_stale_block() {
        let stale = format!("a\n{}\nold body\n{}\nb\n", MARKER_BEGIN, MARKER_END);
        let updated = upsert_block(&stale, &hook_block());
        assert!(!updated.contains("old body"));
        assert!(updated.starts_with("a\n"));
        assert!(updated.ends_with("\nb\n"));
        assert!(updated.contains("command beakerutil"));
    }

    #[test]
    fn test_install_idempotent() {
        let dir = TempDir::new().unwrap();
        let rc = Shell::Bash.rc_file(dir.path());
        assert!(install(&rc).unwrap());
        assert!(!install(&rc).unwrap());
        let text = fs::read_to_string(&rc).unwrap();
        assert_eq!(text.matches(MARKER_END).count(), 1);
    }

    #[test]
    fn test_shell_names() {
        assert_eq!(Shell::from_name("zsh"), Some(Shell::Zsh));
        assert_eq!(Shell::from_name("fish"), None);
        assert!(Shell::Zsh.rc_file(Path::new("/home/u")).ends_with(".zshrc"));
    }
}
