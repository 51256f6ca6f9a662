//! Modbus RTU frame codec: request builders, CRC-16, response validation.
//!
//! The codec is pure byte manipulation — it never touches a serial port and
//! never retries.  Retry/absence policy belongs to the transport layer and
//! its callers.

use thiserror::Error;

/// Function codes used on the bus.
pub const FN_READ_COILS: u8 = 0x01;
pub const FN_READ_HOLDING: u8 = 0x03;
pub const FN_WRITE_COIL: u8 = 0x05;
pub const FN_WRITE_REGISTERS: u8 = 0x10;

/// Coil payload values for write-single-coil.
const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Every write request is echoed back as a fixed 8-byte frame.
pub const WRITE_ECHO_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures at the wire/framing level.  All of these mean "no reading" to
/// the layers above — none of them is fatal to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("response too short to be a frame ({0} bytes)")]
    ShortResponse(usize),

    #[error("crc mismatch: computed {computed:#06x}, frame carries {received:#06x}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("no response within timeout")]
    NoResponse,

    #[error("serial port error: {0}")]
    Port(String),
}

// ---------------------------------------------------------------------------
// CRC
// ---------------------------------------------------------------------------

/// Modbus CRC-16: polynomial 0xA001 (reflected), initial value 0xFFFF.
/// Transmitted low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn finish(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// Read discrete coils (relay channel status).
pub fn read_coils(address: u8, start: u16, count: u16) -> Vec<u8> {
    finish(vec![
        address,
        FN_READ_COILS,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ])
}

/// Read holding registers (sensor values).
pub fn read_holding_registers(address: u8, start: u16, count: u16) -> Vec<u8> {
    finish(vec![
        address,
        FN_READ_HOLDING,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
    ])
}

/// Write a single coil: 0xFF00 turns the channel on, 0x0000 off.
pub fn write_single_coil(address: u8, coil: u16, on: bool) -> Vec<u8> {
    let value = if on { COIL_ON } else { COIL_OFF };
    finish(vec![
        address,
        FN_WRITE_COIL,
        (coil >> 8) as u8,
        (coil & 0xFF) as u8,
        (value >> 8) as u8,
        (value & 0xFF) as u8,
    ])
}

/// Write a contiguous run of registers in one frame.  Used to batch adjacent
/// relay channels (one register per channel, 0x0001 on / 0x0000 off) so a
/// board never sees a burst of back-to-back single writes.
pub fn write_multiple_registers(address: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let count = values.len() as u16;
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(address);
    frame.push(FN_WRITE_REGISTERS);
    frame.push((start >> 8) as u8);
    frame.push((start & 0xFF) as u8);
    frame.push((count >> 8) as u8);
    frame.push((count & 0xFF) as u8);
    frame.push((values.len() * 2) as u8);
    for v in values {
        frame.push((v >> 8) as u8);
        frame.push((v & 0xFF) as u8);
    }
    finish(frame)
}

/// Expected length of a read response carrying `data_bytes` of payload:
/// address + function + byte count + data + CRC.
pub fn read_response_len(data_bytes: usize) -> usize {
    3 + data_bytes + 2
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// A validated response frame with the CRC stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub address: u8,
    pub function: u8,
    /// Everything between the function code and the CRC.  For read
    /// responses this starts with the byte count.
    pub payload: Vec<u8>,
}

/// Validate a raw frame: recompute the CRC over all bytes except the
/// trailing two, then check for a device exception (function high bit set,
/// payload byte carries the exception code).
pub fn parse_response(raw: &[u8]) -> Result<Response, BusError> {
    if raw.len() < 4 {
        return Err(BusError::ShortResponse(raw.len()));
    }

    let (body, crc_bytes) = raw.split_at(raw.len() - 2);
    let received = crc_bytes[0] as u16 | (crc_bytes[1] as u16) << 8;
    let computed = crc16(body);
    if computed != received {
        return Err(BusError::CrcMismatch { computed, received });
    }

    let function = body[1];
    if function & 0x80 != 0 {
        let code = body.get(2).copied().unwrap_or(0);
        return Err(BusError::Exception {
            function: function & 0x7F,
            code,
        });
    }

    Ok(Response {
        address: body[0],
        function,
        payload: body[2..].to_vec(),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- CRC ---------------------------------------------------------------

    #[test]
    fn crc16_known_vector() {
        // 01 03 00 00 00 02 is the canonical read-holding example; its CRC
        // is 0x0BC4, transmitted C4 0B.
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(crc16(&body), 0x0BC4);
    }

    #[test]
    fn crc_appended_low_byte_first() {
        let frame = read_holding_registers(0x01, 0x0000, 2);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn crc_detects_any_single_bit_flip() {
        let frame = read_holding_registers(0x02, 0x0014, 2);
        let body_len = frame.len() - 2;
        let reference = crc16(&frame[..body_len]);
        for byte in 0..body_len {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert_ne!(
                    crc16(&corrupted[..body_len]),
                    reference,
                    "bit {bit} of byte {byte} went undetected"
                );
            }
        }
    }

    // -- Builders ----------------------------------------------------------

    #[test]
    fn read_coils_frame_layout() {
        let frame = read_coils(0x10, 0x0000, 16);
        assert_eq!(&frame[..6], &[0x10, 0x01, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn write_single_coil_on_off_values() {
        let on = write_single_coil(0x10, 7, true);
        assert_eq!(&on[..6], &[0x10, 0x05, 0x00, 0x07, 0xFF, 0x00]);
        let off = write_single_coil(0x10, 7, false);
        assert_eq!(&off[..6], &[0x10, 0x05, 0x00, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn write_multiple_registers_frame_layout() {
        let frame = write_multiple_registers(0x10, 4, &[1, 0, 1]);
        assert_eq!(
            &frame[..13],
            &[0x10, 0x10, 0x00, 0x04, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(frame.len(), 15);
    }

    // -- Parsing -----------------------------------------------------------

    #[test]
    fn parse_roundtrip() {
        let mut raw = vec![0x01, 0x03, 0x04, 0x02, 0x62, 0x00, 0xFA];
        let crc = crc16(&raw);
        raw.push((crc & 0xFF) as u8);
        raw.push((crc >> 8) as u8);

        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.address, 0x01);
        assert_eq!(resp.function, 0x03);
        assert_eq!(resp.payload, vec![0x04, 0x02, 0x62, 0x00, 0xFA]);
    }

    #[test]
    fn parse_rejects_bad_crc() {
        let mut raw = read_holding_registers(0x01, 0, 2);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(
            parse_response(&raw),
            Err(BusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn parse_rejects_short_frame() {
        assert_eq!(
            parse_response(&[0x01, 0x03]),
            Err(BusError::ShortResponse(2))
        );
    }

    #[test]
    fn parse_surfaces_device_exception() {
        let mut raw = vec![0x01, 0x83, 0x02];
        let crc = crc16(&raw);
        raw.push((crc & 0xFF) as u8);
        raw.push((crc >> 8) as u8);

        assert_eq!(
            parse_response(&raw),
            Err(BusError::Exception {
                function: 0x03,
                code: 0x02
            })
        );
    }

    #[test]
    fn read_response_len_accounts_for_header_and_crc() {
        // 2 registers -> 4 data bytes -> 9 byte frame.
        assert_eq!(read_response_len(4), 9);
    }
}
