use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::dlci;
use crate::error::{FrameError, Result};
use crate::fcs::Fcs;

/// Opening/closing flag of the basic option.
pub const BASIC_FLAG: u8 = 0xF9;

/// Opening/closing flag of the advanced option.
pub const ADVANCED_FLAG: u8 = 0x7E;

/// Control escape of the advanced option.
pub const CONTROL_ESCAPE: u8 = 0x7D;

/// Escaped octets are XORed with this mask.
pub const ESCAPE_MASK: u8 = 0x20;

/// Poll/Final bit of the control octet.
pub const PF: u8 = 0x10;

/// Extension bit of address and length octets.
pub(crate) const EA: u8 = 0x01;

/// Command/Response bit of the address octet.
pub(crate) const CR: u8 = 0x02;

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

/// Default maximum information field length (07.10 N1 as used by most
/// cellular modems, `AT+CMUX=0,0,5,127`).
pub const DEFAULT_MAX_PAYLOAD: usize = 127;

/// Largest length the two-octet basic length field can express.
pub const BASIC_MAX_PAYLOAD: usize = 0x7FFF;

/// Frame types of the 07.10 control field, P/F bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Set Asynchronous Balanced Mode: open a DLCI or the whole link.
    Sabm,
    /// Unnumbered Acknowledgement.
    Ua,
    /// Disconnected Mode: negative response.
    Dm,
    /// Disconnect a DLCI or the whole link.
    Disc,
    /// Unnumbered Information with header check only. Carries data.
    Uih,
    /// Unnumbered Information. Carries data, FCS covers the payload.
    Ui,
}

impl FrameType {
    const SABM: u8 = 0x2F;
    const UA: u8 = 0x63;
    const DM: u8 = 0x0F;
    const DISC: u8 = 0x43;
    const UIH: u8 = 0xEF;
    const UI: u8 = 0x03;

    /// Parse a control octet, ignoring the P/F bit.
    pub fn from_control(octet: u8) -> Option<Self> {
        match octet & !PF {
            Self::SABM => Some(Self::Sabm),
            Self::UA => Some(Self::Ua),
            Self::DM => Some(Self::Dm),
            Self::DISC => Some(Self::Disc),
            Self::UIH => Some(Self::Uih),
            Self::UI => Some(Self::Ui),
            _ => None,
        }
    }

    /// Control octet for this frame type with the given P/F bit.
    pub fn control_octet(self, pf: bool) -> u8 {
        let base = match self {
            Self::Sabm => Self::SABM,
            Self::Ua => Self::UA,
            Self::Dm => Self::DM,
            Self::Disc => Self::DISC,
            Self::Uih => Self::UIH,
            Self::Ui => Self::UI,
        };
        if pf {
            base | PF
        } else {
            base
        }
    }

    /// Whether frames of this type are always commands (`Some(true)`),
    /// always responses (`Some(false)`), or either (`None`).
    pub fn is_command(self) -> Option<bool> {
        match self {
            Self::Sabm | Self::Disc => Some(true),
            Self::Ua | Self::Dm => Some(false),
            Self::Uih | Self::Ui => None,
        }
    }

    /// Whether the information field carries channel data.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Uih | Self::Ui)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sabm => "SABM",
            Self::Ua => "UA",
            Self::Dm => "DM",
            Self::Disc => "DISC",
            Self::Uih => "UIH",
            Self::Ui => "UI",
        }
    }
}

/// Framing option negotiated with the peer (`AT+CMUX=<mode>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Length-delimited frames between 0xF9 flags, no transparency.
    #[default]
    Basic,
    /// HDLC-like frames between 0x7E flags with control-escape transparency.
    Advanced,
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Framing option. Default: basic.
    pub mode: FrameMode,
    /// Maximum information field length in bytes. Default: 127.
    pub max_payload_size: usize,
    /// Also escape XON/XOFF in advanced mode (for links with software flow
    /// control).
    pub escape_xon_xoff: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            mode: FrameMode::Basic,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            escape_xon_xoff: false,
        }
    }
}

impl FrameConfig {
    /// Flag octet delimiting frames in this mode.
    pub fn flag(&self) -> u8 {
        match self.mode {
            FrameMode::Basic => BASIC_FLAG,
            FrameMode::Advanced => ADVANCED_FLAG,
        }
    }

    /// Effective maximum information length, capped by the wire format.
    pub fn max_payload(&self) -> usize {
        match self.mode {
            FrameMode::Basic => self.max_payload_size.min(BASIC_MAX_PAYLOAD),
            FrameMode::Advanced => self.max_payload_size,
        }
    }

    /// Worst-case encoded size of one maximum-length frame.
    pub fn max_wire_size(&self) -> usize {
        let max = self.max_payload();
        match self.mode {
            FrameMode::Basic => {
                let len_octets = if max > 127 { 2 } else { 1 };
                max + len_octets + 5
            }
            // Every octet between the flags may need escaping.
            FrameMode::Advanced => 2 * (max + 3) + 2,
        }
    }

    fn needs_escape(&self, byte: u8) -> bool {
        byte == ADVANCED_FLAG
            || byte == CONTROL_ESCAPE
            || (self.escape_xon_xoff && (byte == XON || byte == XOFF))
    }
}

/// One decoded or to-be-encoded link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination DLCI (0 = control channel).
    pub dlci: u8,
    /// Command/Response bit as it appears on the wire.
    pub cr: bool,
    /// Poll/Final bit.
    pub pf: bool,
    /// Frame type.
    pub frame_type: FrameType,
    /// Information field.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with C/R set and the P/F bit customary for its type
    /// (set for SABM/DISC/UA/DM, clear for UIH/UI).
    pub fn new(dlci: u8, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            dlci,
            cr: true,
            pf: !frame_type.carries_data(),
            frame_type,
            payload: payload.into(),
        }
    }

    pub fn sabm(dlci: u8) -> Self {
        Self::new(dlci, FrameType::Sabm, Bytes::new())
    }

    pub fn ua(dlci: u8) -> Self {
        Self::new(dlci, FrameType::Ua, Bytes::new())
    }

    pub fn dm(dlci: u8) -> Self {
        Self::new(dlci, FrameType::Dm, Bytes::new())
    }

    pub fn disc(dlci: u8) -> Self {
        Self::new(dlci, FrameType::Disc, Bytes::new())
    }

    pub fn uih(dlci: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(dlci, FrameType::Uih, payload)
    }

    pub fn with_cr(mut self, cr: bool) -> Self {
        self.cr = cr;
        self
    }

    pub fn with_pf(mut self, pf: bool) -> Self {
        self.pf = pf;
        self
    }

    fn address_octet(&self) -> u8 {
        let cr = if self.cr { CR } else { 0 };
        (self.dlci << 2) | cr | EA
    }
}

/// Encode a frame into the wire format selected by `config`.
///
/// Basic option:
/// ```text
/// ┌──────┬─────────┬─────────┬──────────┬─────────────┬─────┬──────┐
/// │ 0xF9 │ Address │ Control │ Length   │ Information │ FCS │ 0xF9 │
/// │      │ (1B)    │ (1B)    │ (1-2B)   │ (Length B)  │(1B) │      │
/// └──────┴─────────┴─────────┴──────────┴─────────────┴─────┴──────┘
/// ```
/// Advanced option: `0x7E | Address | Control | Information | FCS | 0x7E`
/// with every octet between the flags escaped as needed.
///
/// The FCS covers the header only, except for UI frames where it also
/// covers the information field.
pub fn encode_frame(frame: &Frame, config: &FrameConfig, dst: &mut BytesMut) -> Result<()> {
    if !dlci::is_valid(frame.dlci) {
        return Err(FrameError::InvalidDlci(frame.dlci));
    }

    let max = config.max_payload();
    if frame.payload.len() > max {
        return Err(FrameError::FrameTooLarge {
            size: frame.payload.len(),
            max,
        });
    }

    let address = frame.address_octet();
    let control = frame.frame_type.control_octet(frame.pf);

    match config.mode {
        FrameMode::Basic => {
            let len = frame.payload.len();
            let mut header = [address, control, 0, 0];
            let header_len = if len <= 127 {
                header[2] = ((len as u8) << 1) | EA;
                3
            } else {
                header[2] = ((len << 1) & 0xFE) as u8;
                header[3] = (len >> 7) as u8;
                4
            };

            let mut fcs = Fcs::default();
            fcs.update(&header[..header_len]);
            if frame.frame_type == FrameType::Ui {
                fcs.update(&frame.payload);
            }

            dst.reserve(header_len + len + 3);
            dst.put_u8(BASIC_FLAG);
            dst.put_slice(&header[..header_len]);
            dst.put_slice(&frame.payload);
            dst.put_u8(fcs.finish());
            dst.put_u8(BASIC_FLAG);
        }
        FrameMode::Advanced => {
            let mut fcs = Fcs::default();
            fcs.update(&[address, control]);
            if frame.frame_type == FrameType::Ui {
                fcs.update(&frame.payload);
            }

            dst.reserve(2 * (frame.payload.len() + 3) + 2);
            dst.put_u8(ADVANCED_FLAG);
            put_escaped(config, dst, &[address, control]);
            put_escaped(config, dst, &frame.payload);
            put_escaped(config, dst, &[fcs.finish()]);
            dst.put_u8(ADVANCED_FLAG);
        }
    }

    Ok(())
}

fn put_escaped(config: &FrameConfig, dst: &mut BytesMut, data: &[u8]) {
    for &byte in data {
        if config.needs_escape(byte) {
            dst.put_u8(CONTROL_ESCAPE);
            dst.put_u8(byte ^ ESCAPE_MASK);
        } else {
            dst.put_u8(byte);
        }
    }
}

/// Discard bytes preceding the next flag and collapse repeated flags.
///
/// Returns the number of non-flag bytes discarded. On return the buffer is
/// empty or starts with exactly one flag (possibly followed by more input).
pub fn skip_to_flag(src: &mut BytesMut, flag: u8) -> usize {
    let garbage = src.iter().position(|&b| b == flag).unwrap_or(src.len());
    src.advance(garbage);
    while src.len() >= 2 && src[1] == flag {
        src.advance(1);
    }
    garbage
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// Corrupt input is consumed and reported as a recoverable error; the buffer
/// is left so that the next call resynchronises on the next flag. The closing
/// flag of a decoded frame is left in the buffer since it may double as the
/// opening flag of the next one.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    skip_to_flag(src, config.flag());
    if src.len() < 2 {
        return Ok(None);
    }

    match config.mode {
        FrameMode::Basic => decode_basic(src, config),
        FrameMode::Advanced => decode_advanced(src, config),
    }
}

fn decode_basic(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    // flag, address, control, first length octet
    if src.len() < 4 {
        return Ok(None);
    }

    let address = src[1];
    if address & EA == 0 {
        src.advance(1);
        return Err(FrameError::InvalidAddress(address));
    }
    let control = src[2];

    let (len, len_octets) = if src[3] & EA != 0 {
        ((src[3] >> 1) as usize, 1)
    } else {
        if src.len() < 5 {
            return Ok(None);
        }
        (((src[3] >> 1) as usize) | ((src[4] as usize) << 7), 2)
    };

    let max = config.max_payload();
    if len > max {
        src.advance(1);
        return Err(FrameError::FrameTooLarge { size: len, max });
    }

    let header_len = 2 + len_octets;
    let payload_start = 1 + header_len;
    let fcs_at = payload_start + len;
    let total = fcs_at + 2;
    if src.len() < total {
        return Ok(None);
    }

    let frame_type = FrameType::from_control(control);
    let received = src[fcs_at];
    let mut fcs = Fcs::default();
    fcs.update(&src[1..payload_start]);
    if frame_type == Some(FrameType::Ui) {
        fcs.update(&src[payload_start..fcs_at]);
    }
    if !fcs.matches(received) {
        src.advance(1);
        return Err(FrameError::Checksum { received });
    }
    if src[total - 1] != BASIC_FLAG {
        src.advance(1);
        return Err(FrameError::MissingEndFlag);
    }

    src.advance(payload_start);
    let payload = src.split_to(len).freeze();
    src.advance(1);

    let frame_type = frame_type.ok_or(FrameError::UnknownFrameType(control))?;
    Ok(Some(Frame {
        dlci: address >> 2,
        cr: address & CR != 0,
        pf: control & PF != 0,
        frame_type,
        payload,
    }))
}

fn decode_advanced(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    let max = config.max_payload();
    let end = match src[1..].iter().position(|&b| b == ADVANCED_FLAG) {
        Some(pos) => pos + 1,
        None => {
            let limit = 2 * (max + 3) + 1;
            if src.len() > limit {
                let size = src.len() - 1;
                src.advance(1);
                return Err(FrameError::FrameTooLarge { size, max });
            }
            return Ok(None);
        }
    };

    let mut body = BytesMut::with_capacity(end - 1);
    let mut escaped = false;
    for &byte in &src[1..end] {
        if escaped {
            body.put_u8(byte ^ ESCAPE_MASK);
            escaped = false;
        } else if byte == CONTROL_ESCAPE {
            escaped = true;
        } else {
            body.put_u8(byte);
        }
    }
    src.advance(end);

    if escaped || body.len() < 3 {
        return Err(FrameError::Truncated(body.len()));
    }

    let address = body[0];
    let control = body[1];
    let received = body[body.len() - 1];
    if address & EA == 0 {
        return Err(FrameError::InvalidAddress(address));
    }

    let info_len = body.len() - 3;
    if info_len > max {
        return Err(FrameError::FrameTooLarge {
            size: info_len,
            max,
        });
    }

    let frame_type = FrameType::from_control(control);
    let mut fcs = Fcs::default();
    fcs.update(&body[..2]);
    if frame_type == Some(FrameType::Ui) {
        fcs.update(&body[2..2 + info_len]);
    }
    if !fcs.matches(received) {
        return Err(FrameError::Checksum { received });
    }

    let frame_type = frame_type.ok_or(FrameError::UnknownFrameType(control))?;
    body.advance(2);
    body.truncate(info_len);

    Ok(Some(Frame {
        dlci: address >> 2,
        cr: address & CR != 0,
        pf: control & PF != 0,
        frame_type,
        payload: body.freeze(),
    }))
}
