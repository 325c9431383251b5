//! Credential redaction for log output

/// Shorten a credential token to a loggable prefix.
///
/// Keeps the first 8 characters (enough to tell pool entries apart) and
/// replaces the rest with an ellipsis. Short tokens are fully masked so a
/// 4-character token never lands in a log file whole.
pub fn redact(token: &str) -> String {
    const VISIBLE: usize = 8;
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= VISIBLE {
        return "********".to_string();
    }
    let prefix: String = chars[..VISIBLE].iter().collect();
    format!("{prefix}\u{2026}")
}
