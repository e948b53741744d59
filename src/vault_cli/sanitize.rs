//! Argument redaction and output sanitization for logged CLI invocations.

use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_CSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").unwrap());
static LONG_B64_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/=]{64,}").unwrap());

const SENSITIVE_LINE_MARKERS: &[&str] = &["master password", "[hidden]", "input is hidden"];

/// Redacts `--session`/`--password` values from an argument vector, in both
/// `--flag value` and `--flag=value` form.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut blank_next = false;
    for arg in args {
        if blank_next {
            out.push("***".to_string());
            blank_next = false;
            continue;
        }
        if arg == "--session" || arg == "--password" {
            out.push(arg.clone());
            blank_next = true;
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=') {
            if flag == "--session" || flag == "--password" {
                out.push(format!("{flag}=***"));
                continue;
            }
        }
        out.push(arg.clone());
    }
    out
}

/// Strips ANSI CSI sequences, drops lines matching sensitive-prompt markers,
/// and masks long base64-alphabet runs (session tokens, API keys).
pub fn sanitize_output(raw: &str) -> String {
    let stripped = ANSI_CSI.replace_all(raw, "");
    stripped
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            !SENSITIVE_LINE_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|line| LONG_B64_RUN.replace_all(line, "***").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
}
