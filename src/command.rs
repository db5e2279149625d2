//! Command-line interpretation for children, hooks and detectors.
//!
//! A command string is run through the shell only when it needs to be:
//! either it is an explicit `sh -c` invocation (which is unwrapped so the
//! script is never double-wrapped), or it contains shell metacharacters.
//! Anything else is tokenized by whitespace and executed directly, which
//! keeps the injection surface small.

/// Characters that force a command line through `/bin/sh -c`.
pub const SHELL_METACHARACTERS: &str = "|&;<>*?`$\"'(){}[]~";

const EXPLICIT_SHELL_PREFIXES: [&str; 3] = ["sh -c ", "/bin/sh -c ", "/usr/bin/sh -c "];

/// Returns true when the command contains a character interpreted by the
/// shell.
pub fn has_shell_metachars(command: &str) -> bool {
    command.chars().any(|c| SHELL_METACHARACTERS.contains(c))
}

/// Recognizes an explicit `sh -c <script>` command line and returns the
/// script with one layer of surrounding quotes removed.
pub fn parse_explicit_shell(command: &str) -> Option<&str> {
    for prefix in EXPLICIT_SHELL_PREFIXES {
        if let Some(rest) = command.strip_prefix(prefix) {
            return Some(strip_outer_quotes(rest.trim()));
        }
    }
    None
}

fn strip_outer_quotes(script: &str) -> &str {
    let bytes = script.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'\'' || first == b'"') {
            return &script[1..script.len() - 1];
        }
    }
    script
}

/// Builds the argv for a command string according to the shell-detection
/// rules above. The returned vector is never empty for a non-empty input.
pub fn build_command(command: &str) -> Vec<String> {
    if let Some(script) = parse_explicit_shell(command) {
        return vec!["/bin/sh".into(), "-c".into(), script.into()];
    }
    if has_shell_metachars(command) {
        return vec!["/bin/sh".into(), "-c".into(), command.into()];
    }
    command.split_whitespace().map(str::to_string).collect()
}
