//! Operator commands read from stdin.

use anyhow::{bail, Context, Result};
use uplink_ipc::HostCommand;

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<HostCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "start" => HostCommand::Start,
        "stop" => HostCommand::Stop,
        "bg" | "background" => HostCommand::EnterBackground,
        "fg" | "foreground" => HostCommand::EnterForeground,
        "stats" => HostCommand::GetMetrics,
        "quit" | "exit" => HostCommand::Shutdown,
        "bitrate" => {
            let value = words.next().context("usage: bitrate <bps>")?;
            let bitrate = value
                .parse()
                .with_context(|| format!("invalid bitrate: {}", value))?;
            HostCommand::SetBitrate(bitrate)
        }
        other => bail!(
            "unknown command: {} (start, stop, bg, fg, bitrate <bps>, stats, quit)",
            other
        ),
    };

    if let Some(extra) = words.next() {
        bail!("unexpected argument: {}", extra);
    }
    Ok(Some(command))
}
