use std::fs;

use bytes::BytesMut;
use cmux_frame::{decode_control, decode_frame, skip_to_flag, CONTROL_DLCI};

use crate::cmd::{frame_config, DecodeArgs};
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{parse_hex, print_frames, FrameRecord, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let capture = read_capture(&args)?;
    let records = decode_capture(&capture, args.advanced);
    print_frames(&records, format);

    if records.is_empty() {
        return Err(CliError::new(DATA_INVALID, "no frames found in capture"));
    }
    if records.iter().any(|record| record.error.is_some()) {
        return Ok(DATA_INVALID);
    }
    Ok(SUCCESS)
}

fn read_capture(args: &DecodeArgs) -> CliResult<Vec<u8>> {
    match (&args.hex, &args.file) {
        (Some(hex), _) => parse_hex(hex),
        (None, Some(path)) => fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err)),
        (None, None) => Err(CliError::new(USAGE, "one of --hex or --file is required")),
    }
}

/// Decode every frame in `capture`, keeping corrupt frames as error records.
fn decode_capture(capture: &[u8], advanced: bool) -> Vec<FrameRecord> {
    let config = frame_config(advanced);
    let mut buf = BytesMut::from(capture);
    let mut records = Vec::new();

    loop {
        skip_to_flag(&mut buf, config.flag());
        let offset = capture.len() - buf.len();
        match decode_frame(&mut buf, &config) {
            Ok(Some(frame)) => {
                let messages = if frame.dlci == CONTROL_DLCI && frame.frame_type.carries_data() {
                    decode_control(&frame.payload).unwrap_or_default()
                } else {
                    Vec::new()
                };
                records.push(FrameRecord::from_frame(offset, &frame, &messages));
            }
            Ok(None) => break,
            Err(err) => records.push(FrameRecord::from_error(offset, err.to_string())),
        }
    }

    // A lone trailing flag is the closing flag of the last frame.
    if buf.len() > 1 {
        let offset = capture.len() - buf.len();
        records.push(FrameRecord::from_error(
            offset,
            format!("incomplete frame ({} bytes)", buf.len()),
        ));
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_handshake_and_control_message() {
        // SABM(0), then UIH(0) carrying an MSC command for DLCI 1.
        let capture = parse_hex("f9033f011cf9 f903ef09e305078dfbf9").expect("hex");
        let records = decode_capture(&capture, false);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frame_type, "SABM");
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].frame_type, "UIH");
        assert_eq!(records[1].offset, 6);
        assert!(records[1].error.is_none());
        assert_eq!(records[1].messages[0].kind, "MSC");
        assert!(records[1].messages[0].command);
        assert_eq!(records[1].messages[0].value, "078d");
    }

    #[test]
    fn corrupt_frame_is_reported_and_skipped() {
        let capture = parse_hex("f9033f0100f9 f9037301d7f9").expect("hex");
        let records = decode_capture(&capture, false);
        assert!(records[0].error.is_some());
        let ua = records
            .iter()
            .find(|record| record.frame_type == "UA")
            .expect("UA should survive");
        assert_eq!(ua.dlci, 0);
    }

    #[test]
    fn trailing_partial_frame_is_reported() {
        let capture = parse_hex("f9033f011cf9 f907ef").expect("hex");
        let records = decode_capture(&capture, false);
        assert_eq!(records.len(), 2);
        assert!(records[1].error.is_some());
    }
}
