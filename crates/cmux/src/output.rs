use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use cmux_frame::{dlci_name, ControlMessage, Frame};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::exit::{CliError, CliResult, DATA_INVALID};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct DataOutput {
    kind: &'static str,
    dlci: u8,
    size: usize,
    payload: String,
    timestamp: String,
}

/// Print bytes received on a DLCI.
pub fn print_data(dlci: u8, data: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = DataOutput {
                kind: "data",
                dlci,
                size: data.len(),
                payload: payload_preview(data),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            print_table(
                &["DLCI", "SIZE", "PAYLOAD"],
                vec![vec![
                    dlci.to_string(),
                    data.len().to_string(),
                    payload_preview(data),
                ]],
            );
        }
        OutputFormat::Pretty => {
            println!(
                "dlci={} size={} payload={}",
                dlci,
                data.len(),
                payload_preview(data)
            );
        }
        OutputFormat::Raw => print_raw(data),
    }
}

#[derive(Serialize)]
pub struct FrameRecord {
    pub offset: usize,
    pub dlci: u8,
    pub channel: &'static str,
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub cr: bool,
    pub pf: bool,
    pub length: usize,
    pub payload: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct MessageRecord {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: bool,
    pub value: String,
}

impl FrameRecord {
    pub fn from_frame(offset: usize, frame: &Frame, messages: &[ControlMessage]) -> Self {
        Self {
            offset,
            dlci: frame.dlci,
            channel: dlci_name(frame.dlci),
            frame_type: frame.frame_type.name(),
            cr: frame.cr,
            pf: frame.pf,
            length: frame.payload.len(),
            payload: payload_preview(&frame.payload),
            messages: messages
                .iter()
                .map(|message| MessageRecord {
                    kind: message.kind.name(),
                    command: message.command,
                    value: to_hex(&message.value),
                })
                .collect(),
            error: None,
        }
    }

    pub fn from_error(offset: usize, error: String) -> Self {
        Self {
            offset,
            dlci: 0,
            channel: "INVALID",
            frame_type: "-",
            cr: false,
            pf: false,
            length: 0,
            payload: String::new(),
            messages: Vec::new(),
            error: Some(error),
        }
    }

    fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("error: {error}");
        }
        let mut summary = self.payload.clone();
        for message in &self.messages {
            let role = if message.command { "cmd" } else { "rsp" };
            summary.push_str(&format!(" [{} {} {}]", message.kind, role, message.value));
        }
        summary.trim().to_string()
    }
}

/// Print decoded frames.
pub fn print_frames(records: &[FrameRecord], format: OutputFormat) {
    match format {
        OutputFormat::Json => records.iter().for_each(|record| print_json(record)),
        OutputFormat::Table => {
            let rows = records
                .iter()
                .map(|record| {
                    vec![
                        record.offset.to_string(),
                        record.dlci.to_string(),
                        record.frame_type.to_string(),
                        u8::from(record.cr).to_string(),
                        u8::from(record.pf).to_string(),
                        record.length.to_string(),
                        record.summary(),
                    ]
                })
                .collect();
            print_table(
                &["OFFSET", "DLCI", "TYPE", "C/R", "P/F", "LEN", "CONTENT"],
                rows,
            );
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for record in records {
                println!(
                    "@{} dlci={} ({}) {} cr={} pf={} len={} {}",
                    record.offset,
                    record.dlci,
                    record.channel,
                    record.frame_type,
                    u8::from(record.cr),
                    u8::from(record.pf),
                    record.length,
                    record.summary()
                );
            }
        }
    }
}

#[derive(Serialize)]
struct EncodedOutput<'a> {
    dlci: u8,
    #[serde(rename = "type")]
    frame_type: &'a str,
    size: usize,
    hex: String,
}

/// Print an encoded frame.
pub fn print_encoded(frame: &Frame, wire: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&EncodedOutput {
            dlci: frame.dlci,
            frame_type: frame.frame_type.name(),
            size: wire.len(),
            hex: to_hex(wire),
        }),
        OutputFormat::Table => print_table(
            &["DLCI", "TYPE", "SIZE", "HEX"],
            vec![vec![
                frame.dlci.to_string(),
                frame.frame_type.name().to_string(),
                wire.len().to_string(),
                to_hex(wire),
            ]],
        ),
        OutputFormat::Pretty => println!("{}", to_hex(wire)),
        OutputFormat::Raw => print_raw(wire),
    }
}

#[derive(Serialize)]
struct EventOutput<'a> {
    kind: &'static str,
    side: &'a str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dlci: Option<u8>,
}

/// Print a link or pipe event.
pub fn print_event(side: &str, event: &str, dlci: Option<u8>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&EventOutput {
            kind: "event",
            side,
            event,
            dlci,
        }),
        _ => match dlci {
            Some(dlci) => println!("{side}: dlci {dlci} {event}"),
            None => println!("{side}: {event}"),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_table(header: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.escape_debug().to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Lower-case hex without separators.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Parse hex, ignoring whitespace, `:` separators and `0x` prefixes.
pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ':' || c == ',')
        .map(|token| token.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(
            DATA_INVALID,
            "hex input has an odd number of digits",
        ));
    }

    let bytes = digits.as_bytes();
    bytes
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|text| u8::from_str_radix(text, 16).ok())
                .ok_or_else(|| {
                    CliError::new(
                        DATA_INVALID,
                        format!("invalid hex digits: {}", String::from_utf8_lossy(pair)),
                    )
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_with_separators() {
        let bytes = parse_hex("F9 03 3f:01 0x1c f9").expect("hex should parse");
        assert_eq!(bytes, vec![0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]);
        assert_eq!(to_hex(&bytes), "f9033f011cf9");
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert_eq!(parse_hex("f9 0").unwrap_err().code, DATA_INVALID);
        assert_eq!(parse_hex("zz").unwrap_err().code, DATA_INVALID);
    }

    #[test]
    fn preview_escapes_control_characters() {
        assert_eq!(payload_preview(b"AT\r\n"), "AT\\r\\n");
        assert_eq!(payload_preview(&[0xFF, 0xFE]), "<binary 2 bytes>");
    }
}
