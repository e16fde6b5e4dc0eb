use bytes::{Bytes, BytesMut};
use cmux_frame::{encode_frame, Frame, FrameType};

use crate::cmd::{frame_config, EncodeArgs};
use crate::exit::{frame_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{parse_hex, print_encoded, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let frame = build_frame(&args)?;
    let config = frame_config(args.advanced);

    let mut wire = BytesMut::new();
    encode_frame(&frame, &config, &mut wire).map_err(|err| frame_error("encode failed", err))?;
    print_encoded(&frame, &wire, format);
    Ok(SUCCESS)
}

fn build_frame(args: &EncodeArgs) -> CliResult<Frame> {
    let frame_type = FrameType::from(args.frame_type);
    let payload = match (&args.data, &args.hex) {
        (Some(data), _) => Bytes::copy_from_slice(data.as_bytes()),
        (None, Some(hex)) => Bytes::from(parse_hex(hex)?),
        (None, None) => Bytes::new(),
    };
    if !payload.is_empty() && !frame_type.carries_data() {
        return Err(CliError::new(
            USAGE,
            format!("{} frames carry no information field", frame_type.name()),
        ));
    }

    Ok(Frame::new(args.dlci, frame_type, payload).with_cr(!args.response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::FrameKind;

    fn args(kind: FrameKind) -> EncodeArgs {
        EncodeArgs {
            dlci: 0,
            frame_type: kind,
            data: None,
            hex: None,
            response: false,
            advanced: false,
        }
    }

    #[test]
    fn sabm_on_control_channel() {
        let frame = build_frame(&args(FrameKind::Sabm)).expect("frame should build");
        let mut wire = BytesMut::new();
        encode_frame(&frame, &frame_config(false), &mut wire).expect("frame should encode");
        assert_eq!(wire.as_ref(), &[0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]);
    }

    #[test]
    fn payload_on_handshake_frame_is_usage_error() {
        let mut args = args(FrameKind::Disc);
        args.data = Some("x".to_string());
        assert_eq!(build_frame(&args).unwrap_err().code, USAGE);
    }
}
