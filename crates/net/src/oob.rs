//! Out-of-band (connectionless) packets and the command tokenizer.
//!
//! The pre-session handshake runs over packets prefixed with a 4-byte `-1`
//! marker followed by plain ASCII command text: `getchallenge`, `challenge`,
//! `connect`, `client_connect`, `reject`, `ping`, `ack`, `print`, `echo`.

use wiresync_core::DropError;

/// The connectionless marker: a little-endian `-1` where a sequence number
/// would otherwise sit.
pub const OOB_MARKER: [u8; 4] = (-1i32).to_le_bytes();

/// Whether a datagram is an out-of-band packet.
pub fn is_oob(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == OOB_MARKER
}

/// Frame a command string as an out-of-band packet.
pub fn write_oob(text: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + text.len());
    packet.extend_from_slice(&OOB_MARKER);
    packet.extend_from_slice(text.as_bytes());
    packet
}

/// Extract the command text from an out-of-band packet.
pub fn parse_oob(data: &[u8]) -> Result<String, DropError> {
    if !is_oob(data) {
        return Err(DropError::IllegalMessage(
            "missing out-of-band marker".into(),
        ));
    }
    let text = &data[4..];
    // Tolerate a trailing NUL from C-style senders.
    let text = text.strip_suffix(&[0]).unwrap_or(text);
    std::str::from_utf8(text)
        .map(|s| s.to_owned())
        .map_err(|_| DropError::IllegalMessage("out-of-band text is not UTF-8".into()))
}

/// Split command text on unquoted `;` separators.
pub fn split_commands(text: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in text.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ';' if !in_quote => {
                if !current.trim().is_empty() {
                    commands.push(current.trim().to_owned());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        commands.push(current.trim().to_owned());
    }
    commands
}

/// Tokenize one command line, shell-like: whitespace separates tokens,
/// double quotes group a single token (quotes stripped).
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut has_token = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quote => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oob_roundtrip() {
        let packet = write_oob("getchallenge");
        assert!(is_oob(&packet));
        assert_eq!(parse_oob(&packet).unwrap(), "getchallenge");
    }

    #[test]
    fn test_oob_trailing_nul_tolerated() {
        let mut packet = write_oob("challenge 12345");
        packet.push(0);
        assert_eq!(parse_oob(&packet).unwrap(), "challenge 12345");
    }

    #[test]
    fn test_sequenced_packet_is_not_oob() {
        assert!(!is_oob(&[0, 0, 0, 0, 1]));
        assert!(!is_oob(&[0xFF, 0xFF]));
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize("connect \"two words\" third"),
            vec!["connect", "two words", "third"]
        );
    }

    #[test]
    fn test_tokenize_empty_quoted_token() {
        assert_eq!(tokenize("set name \"\""), vec!["set", "name", ""]);
    }

    #[test]
    fn test_split_commands_respects_quotes() {
        assert_eq!(
            split_commands("echo \"a;b\"; print done"),
            vec!["echo \"a;b\"", "print done"]
        );
    }

    #[test]
    fn test_split_commands_skips_empties() {
        assert_eq!(split_commands(";;ping;;"), vec!["ping"]);
    }
}
