//! DLCI numbering.
//!
//! DLCI 0 carries the multiplexer control channel. DLCIs 1-63 are logical
//! data channels; which ones a modem exposes (AT command port, PPP data
//! port, GNSS, ...) is vendor specific.

/// Multiplexer control channel.
pub const CONTROL_DLCI: u8 = 0;

/// First data channel.
pub const FIRST_DATA_DLCI: u8 = 1;

/// Highest address representable in the 6-bit DLCI field.
pub const MAX_DLCI: u8 = 63;

/// Returns true if `dlci` fits the address field.
pub fn is_valid(dlci: u8) -> bool {
    dlci <= MAX_DLCI
}

/// Returns true if `dlci` may carry application data.
pub fn is_data(dlci: u8) -> bool {
    (FIRST_DATA_DLCI..=MAX_DLCI).contains(&dlci)
}

/// Human-readable label for logs and CLI output.
pub fn dlci_name(dlci: u8) -> &'static str {
    match dlci {
        CONTROL_DLCI => "CONTROL",
        FIRST_DATA_DLCI..=MAX_DLCI => "DATA",
        _ => "INVALID",
    }
}
