/// rustc diagnostic parsing
///
/// rustc with `--error-format=json` writes one JSON object per line on
/// stderr. Anything else on the stream (linker errors, ICE banners) is kept
/// as plain-text diagnostics so no compiler output is ever dropped.
use crate::config::types::{Diagnostic, Severity, SourceLocation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RustcMessage {
    #[serde(rename = "$message_type", default)]
    message_type: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<RustcCode>,
    #[serde(default)]
    level: String,
    #[serde(default)]
    spans: Vec<RustcSpan>,
    #[serde(default)]
    children: Vec<RustcMessage>,
    #[serde(default)]
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RustcCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    file_name: String,
    line_start: u32,
    line_end: u32,
    column_start: u32,
    column_end: u32,
    #[serde(default)]
    is_primary: bool,
}

fn severity(level: &str) -> Severity {
    match level {
        "error" | "error: internal compiler error" => Severity::Error,
        "warning" => Severity::Warning,
        "help" => Severity::Help,
        _ => Severity::Note,
    }
}

impl From<RustcMessage> for Diagnostic {
    fn from(msg: RustcMessage) -> Self {
        let location = msg
            .spans
            .iter()
            .find(|s| s.is_primary)
            .or_else(|| msg.spans.first())
            .map(|s| SourceLocation {
                file: s.file_name.clone(),
                line: s.line_start,
                column: s.column_start,
                line_end: s.line_end,
                column_end: s.column_end,
            });
        Diagnostic {
            severity: severity(&msg.level),
            message: msg.message,
            code: msg.code.map(|c| c.code),
            location,
            children: msg.children.into_iter().map(Diagnostic::from).collect(),
            rendered: msg.rendered,
        }
    }
}

fn plain_text(lines: &[&str]) -> Diagnostic {
    let text = lines.join("\n");
    let severity = if lines
        .iter()
        .any(|l| l.trim_start().to_ascii_lowercase().starts_with("error"))
    {
        Severity::Error
    } else {
        Severity::Note
    };
    let mut diag = Diagnostic::new(severity, text.trim().to_string());
    diag.rendered = Some(text);
    diag
}

/// Parse compiler stderr into diagnostics in emission order
pub fn parse_rustc_output(stderr: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for line in stderr.lines() {
        let parsed = line
            .trim_start()
            .starts_with('{')
            .then(|| serde_json::from_str::<RustcMessage>(line).ok())
            .flatten();
        match parsed {
            Some(msg) => {
                if !pending.is_empty() {
                    diagnostics.push(plain_text(&pending));
                    pending.clear();
                }
                if msg
                    .message_type
                    .as_deref()
                    .is_some_and(|t| t != "diagnostic")
                {
                    continue;
                }
                diagnostics.push(Diagnostic::from(msg));
            }
            None if line.trim().is_empty() => {
                if !pending.is_empty() {
                    diagnostics.push(plain_text(&pending));
                    pending.clear();
                }
            }
            None => pending.push(line),
        }
    }
    if !pending.is_empty() {
        diagnostics.push(plain_text(&pending));
    }
    diagnostics
}
