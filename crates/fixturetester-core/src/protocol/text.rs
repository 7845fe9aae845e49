//! Text protocol codec for the Arduino link
//!
//! Outbound commands are newline-terminated ASCII tokens. Inbound readings
//! are lines shaped `"<name>(<pin>): <integer>"`; anything else is dropped
//! by the caller, since the link is best-effort and re-requested at a
//! higher layer.

/// A parsed reading line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextReading {
    /// Value name reported by the firmware (e.g. `gpio`, `pressure`)
    pub name: String,
    /// Pin/channel the value belongs to
    pub pin: u8,
    pub value: i32,
}

/// Render the read command for one channel, newline-terminated.
pub fn read_command(token: &str, channel: u8) -> String {
    format!("{token} {channel}\n")
}

/// Render the identify command, newline-terminated.
pub fn ident_command(token: &str) -> String {
    format!("{token}\n")
}

/// Parse one inbound line. Returns `None` for anything that is not a
/// well-formed reading; malformed traffic is expected and not an error.
pub fn parse_line(line: &str) -> Option<TextReading> {
    let line = line.trim();
    let open = line.find('(')?;
    let close = line[open..].find(')')? + open;
    if close <= open + 1 {
        return None;
    }

    let name = line[..open].trim();
    if name.is_empty() {
        return None;
    }

    let pin: u8 = line[open + 1..close].trim().parse().ok()?;

    let rest = line[close + 1..].trim_start();
    let value_str = rest.strip_prefix(':')?.trim();
    let value: i32 = value_str.parse().ok()?;

    Some(TextReading {
        name: name.to_string(),
        pin,
        value,
    })
}
