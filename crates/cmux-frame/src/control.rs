//! Multiplexer control channel messages.
//!
//! Carried in the information field of UIH frames on DLCI 0:
//! ```text
//! ┌───────────────┬──────────────────┬──────────────┐
//! │ Type (1B)     │ Length (1-2B EA) │ Value         │
//! │ T|C/R|EA      │                  │ (Length B)    │
//! └───────────────┴──────────────────┴──────────────┘
//! ```
//! The C/R bit in the type octet marks commands (1) and responses (0)
//! independently of the C/R bit in the frame address.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{CR, EA};
use crate::dlci;
use crate::error::{FrameError, Result};

/// Control message types (type octet with C/R and EA cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// DLC parameter negotiation.
    Pn,
    /// Power saving control.
    Psc,
    /// Multiplexer close down.
    Cld,
    /// Test command (echoed by the peer).
    Test,
    /// Flow control on: the sender may transmit again.
    FcOn,
    /// Flow control off: the sender must stop transmitting data.
    FcOff,
    /// Modem status command (per-DLCI V.24 signals).
    Msc,
    /// Non supported command response.
    Nsc,
    /// Remote port negotiation.
    Rpn,
    /// Remote line status.
    Rls,
    /// Service negotiation.
    Snc,
    /// Anything else; the raw type octet with C/R and EA cleared.
    Unknown(u8),
}

impl ControlType {
    const PN: u8 = 0x80;
    const PSC: u8 = 0x40;
    const CLD: u8 = 0xC0;
    const TEST: u8 = 0x20;
    const FCON: u8 = 0xA0;
    const FCOFF: u8 = 0x60;
    const MSC: u8 = 0xE0;
    const NSC: u8 = 0x10;
    const RPN: u8 = 0x90;
    const RLS: u8 = 0x50;
    const SNC: u8 = 0xD0;

    pub fn from_octet(octet: u8) -> Self {
        match octet & !(CR | EA) {
            Self::PN => Self::Pn,
            Self::PSC => Self::Psc,
            Self::CLD => Self::Cld,
            Self::TEST => Self::Test,
            Self::FCON => Self::FcOn,
            Self::FCOFF => Self::FcOff,
            Self::MSC => Self::Msc,
            Self::NSC => Self::Nsc,
            Self::RPN => Self::Rpn,
            Self::RLS => Self::Rls,
            Self::SNC => Self::Snc,
            other => Self::Unknown(other),
        }
    }

    /// Type octet with C/R and EA cleared.
    pub fn bits(self) -> u8 {
        match self {
            Self::Pn => Self::PN,
            Self::Psc => Self::PSC,
            Self::Cld => Self::CLD,
            Self::Test => Self::TEST,
            Self::FcOn => Self::FCON,
            Self::FcOff => Self::FCOFF,
            Self::Msc => Self::MSC,
            Self::Nsc => Self::NSC,
            Self::Rpn => Self::RPN,
            Self::Rls => Self::RLS,
            Self::Snc => Self::SNC,
            Self::Unknown(bits) => bits & !(CR | EA),
        }
    }

    /// Type octet as transmitted.
    pub fn octet(self, command: bool) -> u8 {
        let cr = if command { CR } else { 0 };
        self.bits() | cr | EA
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pn => "PN",
            Self::Psc => "PSC",
            Self::Cld => "CLD",
            Self::Test => "TEST",
            Self::FcOn => "FCON",
            Self::FcOff => "FCOFF",
            Self::Msc => "MSC",
            Self::Nsc => "NSC",
            Self::Rpn => "RPN",
            Self::Rls => "RLS",
            Self::Snc => "SNC",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

/// One control channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: ControlType,
    /// C/R bit of the type octet: true for commands.
    pub command: bool,
    pub value: Bytes,
}

impl ControlMessage {
    pub fn command(kind: ControlType, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            command: true,
            value: value.into(),
        }
    }

    pub fn response(kind: ControlType, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            command: false,
            value: value.into(),
        }
    }

    /// The response a peer owes for this command, echoing its value.
    pub fn echo_response(&self) -> Self {
        Self::response(self.kind, self.value.clone())
    }

    /// NSC response for an unsupported command type octet.
    pub fn not_supported(type_octet: u8) -> Self {
        Self::response(ControlType::Nsc, vec![type_octet])
    }

    /// Encode into `dst` (one UIH information field may hold several).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let len = self.value.len();
        if len > 0x7FFF {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: 0x7FFF,
            });
        }

        dst.put_u8(self.kind.octet(self.command));
        if len <= 127 {
            dst.put_u8(((len as u8) << 1) | EA);
        } else {
            dst.put_u8(((len << 1) & 0xFE) as u8);
            dst.put_u8(((len >> 7) << 1) as u8 | EA);
        }
        dst.put_slice(&self.value);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.value.len() + 3);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decode every control message in a DLCI 0 information field.
pub fn decode_control(payload: &Bytes) -> Result<Vec<ControlMessage>> {
    let mut src = payload.clone();
    let mut messages = Vec::new();

    while src.has_remaining() {
        let type_octet = src.get_u8();
        if type_octet & EA == 0 {
            return Err(FrameError::InvalidControl("multi-octet type field"));
        }

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            if !src.has_remaining() {
                return Err(FrameError::InvalidControl("truncated length"));
            }
            if shift > 7 {
                return Err(FrameError::InvalidControl("length field too long"));
            }
            let octet = src.get_u8();
            len |= ((octet >> 1) as usize) << shift;
            shift += 7;
            if octet & EA != 0 {
                break;
            }
        }

        if src.remaining() < len {
            return Err(FrameError::InvalidControl("truncated value"));
        }

        messages.push(ControlMessage {
            kind: ControlType::from_octet(type_octet),
            command: type_octet & CR != 0,
            value: src.split_to(len),
        });
    }

    Ok(messages)
}

/// V.24 signals carried by an MSC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemStatus {
    pub dlci: u8,
    /// Flow control: the sender of the MSC cannot accept frames.
    pub fc: bool,
    /// Ready to communicate.
    pub rtc: bool,
    /// Ready to receive.
    pub rtr: bool,
    /// Incoming call indicator.
    pub ic: bool,
    /// Data valid.
    pub dv: bool,
}

impl ModemStatus {
    const FC: u8 = 0x02;
    const RTC: u8 = 0x04;
    const RTR: u8 = 0x08;
    const IC: u8 = 0x40;
    const DV: u8 = 0x80;

    /// Signals of a channel ready to exchange data.
    pub fn ready(dlci: u8) -> Self {
        Self {
            dlci,
            fc: false,
            rtc: true,
            rtr: true,
            ic: false,
            dv: true,
        }
    }

    pub fn to_value(&self) -> [u8; 2] {
        let mut signals = EA;
        for (set, bit) in [
            (self.fc, Self::FC),
            (self.rtc, Self::RTC),
            (self.rtr, Self::RTR),
            (self.ic, Self::IC),
            (self.dv, Self::DV),
        ] {
            if set {
                signals |= bit;
            }
        }
        [(self.dlci << 2) | CR | EA, signals]
    }

    /// Parse an MSC value (address octet, signals octet, optional break).
    pub fn from_value(value: &[u8]) -> Result<Self> {
        if value.len() < 2 {
            return Err(FrameError::InvalidControl("MSC value too short"));
        }
        let dlci = value[0] >> 2;
        if !dlci::is_valid(dlci) {
            return Err(FrameError::InvalidDlci(dlci));
        }
        let signals = value[1];
        Ok(Self {
            dlci,
            fc: signals & Self::FC != 0,
            rtc: signals & Self::RTC != 0,
            rtr: signals & Self::RTR != 0,
            ic: signals & Self::IC != 0,
            dv: signals & Self::DV != 0,
        })
    }
}
