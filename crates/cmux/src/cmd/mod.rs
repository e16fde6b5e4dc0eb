use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use cmux_frame::{FrameConfig, FrameMode, FrameType};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod channel;
pub mod decode;
pub mod demo;
pub mod encode;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one peer on a Unix socket and print what arrives per DLCI.
    Listen(ListenArgs),
    /// Connect, open a DLCI, send a payload and optionally wait for a reply.
    Send(SendArgs),
    /// Decode a captured byte stream into frames.
    Decode(DecodeArgs),
    /// Encode a single frame and print it as hex.
    Encode(EncodeArgs),
    /// Run a DTE and a DCE back to back in memory.
    Demo(DemoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Encode(args) => encode::run(args, format),
        Command::Demo(args) => demo::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// DLCIs to register (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "1,2")]
    pub dlcis: Vec<u8>,
    /// Send every received payload back on the same DLCI.
    #[arg(long)]
    pub echo: bool,
    /// Exit after receiving N payloads.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// DLCI to send on.
    #[arg(long, short = 'd', default_value = "1")]
    pub dlci: u8,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["file", "hex"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "hex"])]
    pub file: Option<PathBuf>,
    /// Hex payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub hex: Option<String>,
    /// Append CR LF to the payload (AT commands).
    #[arg(long)]
    pub crlf: bool,
    /// Wait for one reply on the DLCI and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Timeout for connect, open, close and disconnect.
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex capture (whitespace and ':' separators allowed).
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub hex: Option<String>,
    /// Binary capture file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Advanced option framing (0x7E flags, transparency).
    #[arg(long)]
    pub advanced: bool,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Destination DLCI.
    #[arg(long, default_value = "0")]
    pub dlci: u8,
    /// Frame type.
    #[arg(long = "type", value_enum, default_value = "uih")]
    pub frame_type: FrameKind,
    /// String information field.
    #[arg(long, conflicts_with = "hex")]
    pub data: Option<String>,
    /// Hex information field.
    #[arg(long)]
    pub hex: Option<String>,
    /// Clear the C/R bit.
    #[arg(long)]
    pub response: bool,
    /// Advanced option framing.
    #[arg(long)]
    pub advanced: bool,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Command sent on the AT channel.
    #[arg(long, default_value = "AT+CGDCONT=1,\"IP\",\"trackunit.m2m\"")]
    pub command: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum FrameKind {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
    Ui,
}

impl From<FrameKind> for FrameType {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Sabm => FrameType::Sabm,
            FrameKind::Ua => FrameType::Ua,
            FrameKind::Dm => FrameType::Dm,
            FrameKind::Disc => FrameType::Disc,
            FrameKind::Uih => FrameType::Uih,
            FrameKind::Ui => FrameType::Ui,
        }
    }
}

pub fn frame_config(advanced: bool) -> FrameConfig {
    FrameConfig {
        mode: if advanced {
            FrameMode::Advanced
        } else {
            FrameMode::Basic
        },
        ..FrameConfig::default()
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn advanced_flag_selects_mode() {
        assert_eq!(frame_config(true).mode, FrameMode::Advanced);
        assert_eq!(frame_config(false).flag(), 0xF9);
    }
}
