use crate::errors::{AppError, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

pub const PILEUP_TOOL: &str = "samtools";
pub const CALLER_TOOL: &str = "bcftools";

const CAPTURE_INITIAL_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTools {
    pub samtools: String,
    pub bcftools: Option<String>,
}

impl ExternalTools {
    pub fn discover(has_caller: bool) -> Result<Self> {
        let samtools = PILEUP_TOOL.to_string();
        if !exists_command(&samtools) {
            return Err(AppError::ToolMissing { tool: samtools });
        }
        probe_pileup_tool(&samtools)?;

        let bcftools = if has_caller {
            let caller = CALLER_TOOL.to_string();
            if !exists_command(&caller) {
                return Err(AppError::ToolMissing { tool: caller });
            }
            Some(caller)
        } else {
            None
        };

        Ok(Self { samtools, bcftools })
    }
}

/// Runs the tool with no arguments and checks its usage banner: exit
/// status 1, third line `Version: …`, versions 0.* rejected.
fn probe_pileup_tool(tool: &str) -> Result<()> {
    let output = Command::new(tool)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AppError::ToolMissing {
                    tool: tool.to_string(),
                }
            } else {
                AppError::Io(err)
            }
        })?;
    validate_probe_output(tool, output.status.code(), &output.stdout, &output.stderr)
}

/// Real samtools prints its usage banner on stderr; stub tools commonly
/// print on stdout. Prefer stdout, fall back to stderr.
fn validate_probe_output(
    tool: &str,
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<()> {
    if code != Some(1) {
        return Err(AppError::ToolProbeFailed {
            tool: tool.to_string(),
            reason: format!("expected usage exit status 1 from a no-argument run, got {code:?}"),
        });
    }
    let banner = if stdout.is_empty() { stderr } else { stdout };
    let banner = String::from_utf8_lossy(banner);
    let Some(third_line) = banner.lines().nth(2) else {
        return Err(AppError::ToolProbeFailed {
            tool: tool.to_string(),
            reason: "usage banner has fewer than three lines".to_string(),
        });
    };
    if !third_line.starts_with("Version:") {
        return Err(AppError::ToolProbeFailed {
            tool: tool.to_string(),
            reason: format!("third usage line does not announce a version: {third_line:?}"),
        });
    }
    if third_line.starts_with("Version: 0.") {
        return Err(AppError::ToolVersionRejected {
            tool: tool.to_string(),
            version: third_line.trim_start_matches("Version:").trim().to_string(),
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct ChunkProcess {
    child: Child,
    command: String,
    stderr_capture: NamedTempFile,
}

pub fn spawn_chunk_pipeline(command: &str, scratch_dir: &Path) -> Result<ChunkProcess> {
    let stderr_capture = Builder::new()
        .prefix("chunk_stderr_")
        .suffix(".log")
        .tempfile_in(scratch_dir)?;
    let stderr_file = stderr_capture.reopen()?;

    debug!(command, "spawning chunk pipeline");
    // a failure in any pipeline stage must surface, not just the last one
    let shell_command = if shell_supports_pipefail() {
        format!("set -o pipefail; {command}")
    } else {
        command.to_string()
    };
    let child = Command::new("sh")
        .arg("-c")
        .arg(shell_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr_file))
        .spawn()?;

    Ok(ChunkProcess {
        child,
        command: command.to_string(),
        stderr_capture,
    })
}

impl ChunkProcess {
    /// Reads stdout to EOF, then reaps the process; nonzero exit is fatal.
    pub fn capture(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(CAPTURE_INITIAL_CAPACITY);
        if let Some(mut stdout) = self.child.stdout.take() {
            stdout.read_to_end(&mut buffer)?;
        }
        let status = self.child.wait()?;
        if !status.success() {
            let stderr = self.read_stderr();
            return Err(AppError::SubprocessFailed {
                command: self.command,
                code: status.code(),
                stderr,
            });
        }
        Ok(buffer)
    }

    fn read_stderr(&self) -> String {
        std::fs::read(self.stderr_capture.path())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

fn shell_supports_pipefail() -> bool {
    static PIPEFAIL: OnceLock<bool> = OnceLock::new();
    *PIPEFAIL.get_or_init(|| {
        Command::new("sh")
            .arg("-c")
            .arg("set -o pipefail")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

/// First PATH hit wins; a name containing a separator is taken as a
/// direct path and not searched.
pub fn exists_command(name: &str) -> bool {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(name).is_file();
    }
    let Some(search_path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&search_path).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::validate_probe_output;
    use crate::errors::AppError;

    const GOOD_BANNER: &[u8] =
        b"Program: samtools (Tools for alignments)\n\nVersion: 1.19 (using htslib 1.19)\n";

    #[test]
    fn accepts_modern_version_banner_on_stdout() {
        let result = validate_probe_output("samtools", Some(1), GOOD_BANNER, b"");
        assert!(result.is_ok());
    }

    #[test]
    fn accepts_banner_printed_on_stderr() {
        let result = validate_probe_output("samtools", Some(1), b"", GOOD_BANNER);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_zero_dot_versions() {
        let banner = b"Program: samtools\n\nVersion: 0.1.19\n";
        let error = validate_probe_output("samtools", Some(1), banner, b"")
            .expect_err("expected version rejection");
        assert!(matches!(error, AppError::ToolVersionRejected { .. }));
        assert!(error.to_string().contains("versions 0.*"));
    }

    #[test]
    fn rejects_unexpected_exit_status() {
        let result = validate_probe_output("samtools", Some(0), GOOD_BANNER, b"");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_banner_without_version_line() {
        let result = validate_probe_output("samtools", Some(1), b"one\ntwo\nthree\n", b"");
        assert!(result.is_err());
    }
}
