use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::ShellKind;

/// Per-shell knowledge needed to run an uploaded script.
pub trait Shell {
    /// Extension given to the uploaded script.
    fn extension(&self) -> &'static str;

    /// Argument vector that executes the script at `script` on the VM.
    fn invocation(&self, script: &str) -> Vec<String>;

    /// Remote path the script for `stage` is uploaded to, relative to the
    /// login directory.
    fn remote_path(&self, stage: &str) -> String {
        format!("{stage}.{}", self.extension())
    }
}

impl Shell for ShellKind {
    fn extension(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Pwsh => "ps1",
        }
    }

    fn invocation(&self, script: &str) -> Vec<String> {
        match self {
            ShellKind::Bash => vec!["bash".into(), script.into()],
            ShellKind::Pwsh => [
                "pwsh",
                "-NoProfile",
                "-NoLogo",
                "-InputFormat",
                "text",
                "-OutputFormat",
                "text",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-EncodedCommand",
            ]
            .into_iter()
            .map(String::from)
            .chain([encode_pwsh_command(script)])
            .collect(),
        }
    }
}

/// The `-EncodedCommand` payload that runs `script` with UTF-8 console
/// encoding and exits with its exit code.
///
/// PowerShell over ssh mangles non-ASCII script text, so the wrapper is sent
/// as base64 of its UTF-16LE encoding, which is what `-EncodedCommand` takes.
pub fn encode_pwsh_command(script: &str) -> String {
    let block = format!(
        "$OutputEncoding = [console]::InputEncoding = [console]::OutputEncoding = New-Object System.Text.UTF8Encoding\r\n\
         pwsh {script}\r\n\
         exit $LASTEXITCODE\r\n"
    );
    let utf16: Vec<u8> = block.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(utf16)
}
