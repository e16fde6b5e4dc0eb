//! GSM 07.10 frame codec for the CMUX multiplexer.
//!
//! Every frame on the wire carries:
//! - An opening and closing flag (0xF9 basic, 0x7E advanced)
//! - An address octet with the 6-bit DLCI and the C/R bit
//! - A control octet naming the frame type and the P/F bit
//! - A length field (basic option only) and the information field
//! - An 8-bit frame check sequence
//!
//! [`FrameDecoder`] turns an unreliable byte stream into frames, dropping
//! corrupt input and resynchronising on the next flag. [`control`] encodes
//! the messages exchanged on the control channel (DLCI 0).

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod control;
pub mod decoder;
pub mod dlci;
pub mod error;
pub mod fcs;

#[cfg(feature = "async")]
pub use async_codec::CmuxCodec;
pub use codec::{
    decode_frame, encode_frame, skip_to_flag, Frame, FrameConfig, FrameMode, FrameType,
    ADVANCED_FLAG, BASIC_FLAG, BASIC_MAX_PAYLOAD, DEFAULT_MAX_PAYLOAD,
};
pub use control::{decode_control, ControlMessage, ControlType, ModemStatus};
pub use decoder::{DecoderStats, FrameDecoder};
pub use dlci::{dlci_name, CONTROL_DLCI, FIRST_DATA_DLCI, MAX_DLCI};
pub use error::{FrameError, Result};
