//! PowerShell command lines, script staging, and error stream cleanup.
#![expect(
    clippy::little_endian_bytes,
    reason = "-EncodedCommand takes UTF-16LE"
)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use roxmltree::Document;

use crate::template::quote;

/// Longest command line sent inline; longer scripts are staged as files.
pub const MAX_INLINE_COMMAND: usize = 8000;

const POWERSHELL: &str = "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass";

/// Base64 characters appended to the staging file per command.
const UPLOAD_CHUNK: usize = 6000;

const PREAMBLE: &str =
    "$ErrorActionPreference = 'Stop'\r\n$ProgressPreference = 'SilentlyContinue'\r\n";

const CLIXML_MARKER: &str = "#< CLIXML";

fn encode(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

/// Prepends the stop-on-error preamble.
pub(super) fn with_preamble(body: &str) -> String {
    format!("{PREAMBLE}{body}")
}

/// Command line running `script` through `-EncodedCommand`.
pub(super) fn inline_command(script: &str) -> String {
    format!("{POWERSHELL} -EncodedCommand {}", encode(script))
}

/// Script body written to a remote file and run in several steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct StagedScript {
    path: String,
    payload: String,
}

impl StagedScript {
    /// Prepares `script` for upload to `path`.
    pub(super) fn new(path: String, script: &str) -> Self {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(script.as_bytes());
        Self {
            path,
            payload: STANDARD.encode(bytes),
        }
    }

    /// Remote path of the staged script.
    pub(super) fn path(&self) -> &str {
        &self.path
    }

    fn encoded_path(&self) -> String {
        format!("{}.b64", self.path)
    }

    /// `cmd` commands appending the base64 payload chunk by chunk.
    pub(super) fn upload_commands(&self) -> Vec<String> {
        let target = self.encoded_path();
        self.payload
            .as_bytes()
            .chunks(UPLOAD_CHUNK)
            .map(|chunk| {
                let text = String::from_utf8_lossy(chunk);
                format!("echo {text}>>\"{target}\"")
            })
            .collect()
    }

    /// Command decoding the uploaded payload into the script file.
    pub(super) fn materialize_command(&self) -> String {
        let script = format!(
            concat!(
                "$ErrorActionPreference = 'Stop'\r\n",
                "$staged = {path}\r\n",
                "$encoded = (Get-Content -LiteralPath {encoded} | ForEach-Object {{ $_.Trim() }}) -join ''\r\n",
                "[System.IO.File]::WriteAllBytes($staged, [System.Convert]::FromBase64String($encoded))\r\n",
                "Remove-Item -LiteralPath {encoded} -Force\r\n"
            ),
            path = quote(&self.path),
            encoded = quote(&self.encoded_path()),
        );
        inline_command(&script)
    }

    /// Command running the staged file.
    pub(super) fn run_command(&self) -> String {
        format!("{POWERSHELL} -File \"{}\"", self.path)
    }

    /// Command removing the staged file and any leftover payload.
    pub(super) fn cleanup_command(&self) -> String {
        format!(
            "del /F /Q \"{}\" \"{}\" 2>NUL",
            self.path,
            self.encoded_path()
        )
    }
}

/// Reduces PowerShell's serialised error stream to plain text.
///
/// Non-CLIXML input is returned unchanged.
#[must_use]
pub fn clean_stderr(raw: &str) -> String {
    let Some(rest) = raw.trim_start().strip_prefix(CLIXML_MARKER) else {
        return raw.to_owned();
    };
    let Ok(doc) = Document::parse(rest.trim()) else {
        return raw.to_owned();
    };
    let text: String = doc
        .descendants()
        .filter(|node| node.tag_name().name() == "S" && node.attribute("S") == Some("Error"))
        .filter_map(|node| node.text())
        .map(decode_clixml_escapes)
        .collect();
    text.trim_end().to_owned()
}

/// Decodes `_xHHHH_` escapes used by CLIXML for control characters.
fn decode_clixml_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("_x") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let decoded = tail
            .get(2..6)
            .filter(|_| tail.get(6..7) == Some("_"))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);
        if let Some(ch) = decoded {
            out.push(ch);
            rest = tail.get(7..).unwrap_or_default();
        } else {
            out.push_str("_x");
            rest = tail.get(2..).unwrap_or_default();
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_utf16(encoded: &str) -> String {
        let bytes = STANDARD.decode(encoded).expect("valid base64");
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).expect("valid UTF-16")
    }

    #[test]
    fn inline_command_encodes_utf16le() {
        let line = inline_command("Get-VM -Name 'ü'");
        let encoded = line
            .strip_prefix(&format!("{POWERSHELL} -EncodedCommand "))
            .expect("prefix");
        assert_eq!(decode_utf16(encoded), "Get-VM -Name 'ü'");
    }

    #[test]
    fn staged_upload_reassembles_the_script() {
        let script = "Write-Output 'x'\r\n".repeat(2000);
        let staged = StagedScript::new(String::from("C:\\Temp\\s.ps1"), &script);
        let uploads = staged.upload_commands();
        assert!(uploads.len() > 1);
        let joined: String = uploads
            .iter()
            .map(|cmd| {
                cmd.strip_prefix("echo ")
                    .and_then(|rest| rest.strip_suffix(">>\"C:\\Temp\\s.ps1.b64\""))
                    .expect("upload command shape")
            })
            .collect();
        let bytes = STANDARD.decode(joined).expect("valid base64");
        assert_eq!(bytes.get(..3), Some([0xEF, 0xBB, 0xBF].as_slice()));
        assert_eq!(bytes.get(3..), Some(script.as_bytes()));
        assert!(uploads.iter().all(|cmd| cmd.len() <= MAX_INLINE_COMMAND));
    }

    #[test]
    fn staged_commands_reference_the_path() {
        let staged = StagedScript::new(String::from("C:\\Temp\\hv_1.ps1"), "x");
        assert!(staged.run_command().ends_with("-File \"C:\\Temp\\hv_1.ps1\""));
        assert!(staged.cleanup_command().contains("C:\\Temp\\hv_1.ps1.b64"));
        assert!(staged.materialize_command().len() <= MAX_INLINE_COMMAND);
    }

    #[test]
    fn cleans_clixml_error_stream() {
        let raw = concat!(
            "#< CLIXML\r\n",
            r#"<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">"#,
            r#"<S S="Error">Get-VHD : not found_x000D__x000A_</S>"#,
            r#"<S S="Progress">ignored</S>"#,
            r#"<S S="Error">At line:1 char:1_x000D__x000A_</S></Objs>"#
        );
        assert_eq!(
            clean_stderr(raw),
            "Get-VHD : not found\r\nAt line:1 char:1"
        );
    }

    #[test]
    fn plain_stderr_is_untouched() {
        assert_eq!(clean_stderr("plain failure\n"), "plain failure\n");
    }

    #[test]
    fn unknown_escapes_survive() {
        assert_eq!(decode_clixml_escapes("a_xZZ_b_x0041_"), "a_xZZ_bA");
    }
}
