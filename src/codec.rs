/// Modbus RTU wire codec
///
/// Pure functions over byte buffers: compose request ADUs, validate and
/// parse response ADUs, compute checksums and infer expected response
/// lengths. Nothing here touches a port or mutates register state.
///
/// ADU layout (RTU): slave-id (1 B) | PDU | CRC-16 (2 B, low byte first).
/// Addresses and counts inside the PDU are big-endian.
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{BusError, BusResult};
use crate::protocol::{
    FunctionCode, SlaveId, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
};

/// CRC calculator for RTU frames
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Bytes in the ADU that are not part of the PDU (slave id + CRC)
pub const ADU_OVERHEAD: usize = 3;

/// Smallest frame the parser will look at
pub const MIN_ADU_SIZE: usize = 4;

/// Size of an exception response ADU
pub const EXCEPTION_ADU_SIZE: usize = 5;

/// Size of a read request or write-echo ADU
pub const FIXED_ADU_SIZE: usize = 8;

/// Largest legal RTU frame
pub const MAX_ADU_SIZE: usize = 256;

/// Exception marker in the echoed function code
pub const EXCEPTION_BIT: u8 = 0x80;

/// Compute the Modbus CRC-16 of a byte slice
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC to a frame, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Parsed content of a validated response ADU
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Device refused the request with the given exception code
    Exception(u8),
    /// Data bytes of a read response (after the byte-count byte)
    Read(Vec<u8>),
    /// Write confirmation echo
    Write,
}

/// Compose a read request ADU
///
/// Counts are validated against the protocol ceilings: 2000 for
/// single-bit reads, 125 for 16-bit reads.
pub fn build_read_request(
    slave_id: SlaveId,
    function: FunctionCode,
    address: u16,
    count: u16,
) -> BusResult<Vec<u8>> {
    let ceiling = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => MAX_READ_BITS,
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => MAX_READ_REGISTERS,
        other => return Err(BusError::invalid_function(other.to_u8())),
    };
    if count == 0 || count > ceiling {
        return Err(BusError::invalid_address(address, count));
    }

    let mut frame = Vec::with_capacity(FIXED_ADU_SIZE);
    frame.push(slave_id);
    frame.push(function.to_u8());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    Ok(frame)
}

/// Compose a single-element write request ADU
///
/// For single-coil writes any non-zero value is transmitted as 0xFF00.
pub fn build_single_write(
    slave_id: SlaveId,
    function: FunctionCode,
    address: u16,
    value: u16,
) -> BusResult<Vec<u8>> {
    let value = match function {
        FunctionCode::WriteSingleCoil => {
            if value != 0 {
                0xFF00
            } else {
                0x0000
            }
        }
        FunctionCode::WriteSingleRegister => value,
        other => return Err(BusError::invalid_function(other.to_u8())),
    };

    let mut frame = Vec::with_capacity(FIXED_ADU_SIZE);
    frame.push(slave_id);
    frame.push(function.to_u8());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    Ok(frame)
}

/// Compose a multi-element write request ADU
///
/// `count` is the element count; `payload` carries the element bytes
/// (registers big-endian, coils packed LSB-first).
pub fn build_multi_write(
    slave_id: SlaveId,
    function: FunctionCode,
    address: u16,
    count: u16,
    payload: &[u8],
) -> BusResult<Vec<u8>> {
    let (ceiling, expected_len) = match function {
        FunctionCode::WriteMultipleCoils => (MAX_WRITE_BITS, (count as usize + 7) / 8),
        FunctionCode::WriteMultipleRegisters => (MAX_WRITE_REGISTERS, count as usize * 2),
        other => return Err(BusError::invalid_function(other.to_u8())),
    };
    if count == 0 || count > ceiling {
        return Err(BusError::invalid_address(address, count));
    }
    if payload.len() != expected_len {
        return Err(BusError::invalid_data(format!(
            "write payload is {} byte(s), expected {}",
            payload.len(),
            expected_len
        )));
    }

    let mut frame = Vec::with_capacity(FIXED_ADU_SIZE + 1 + payload.len());
    frame.push(slave_id);
    frame.push(function.to_u8());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    Ok(frame)
}

/// Pack coil states into bytes, LSB first
pub fn pack_coils(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Serialize 16-bit elements big-endian
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for &word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Expected length of a successful read response ADU
pub fn read_response_len(single_bit: bool, count: u16) -> usize {
    let data_len = if single_bit {
        (count as usize + 7) / 8
    } else {
        count as usize * 2
    };
    // slave + function + byte count + data + crc
    data_len + 5
}

/// Expected length of a write confirmation ADU
pub fn write_response_len() -> usize {
    FIXED_ADU_SIZE
}

/// Frame-complete predicate for the port's frame reader
///
/// A frame is complete once it reaches the expected length, or the short
/// exception length when the echoed function code carries the exception
/// bit.
pub fn expect_frame(expected: usize) -> impl Fn(&[u8]) -> bool + Send + Sync {
    move |buf: &[u8]| {
        if buf.len() < 2 {
            return false;
        }
        if buf[1] & EXCEPTION_BIT != 0 {
            return buf.len() >= EXCEPTION_ADU_SIZE;
        }
        buf.len() >= expected
    }
}

/// Validate a response against its request and extract the payload
///
/// Checks, in order: minimum length, structural length for the claimed
/// shape, CRC, slave-id echo and function-code echo (masked of the
/// exception bit). Length and CRC violations surface as `Frame` /
/// `CrcMismatch`; echo mismatches as `Protocol`.
pub fn parse_response(request: &[u8], response: &[u8]) -> BusResult<ResponsePayload> {
    debug_assert!(request.len() >= MIN_ADU_SIZE);

    if response.len() < MIN_ADU_SIZE {
        return Err(BusError::frame(format!(
            "response too short: {} byte(s)",
            response.len()
        )));
    }

    let request_function = request[1];
    let is_exception = response[1] & EXCEPTION_BIT != 0;

    // PDU size according to the response's own claim
    let pdu_size = if is_exception {
        2
    } else if FunctionCode::from_u8(request_function)?.is_read_function() {
        response[2] as usize + 2
    } else {
        5
    };

    let total = pdu_size + ADU_OVERHEAD;
    if total > MAX_ADU_SIZE || response.len() < total {
        return Err(BusError::frame(format!(
            "response claims {} byte(s), got {}",
            total,
            response.len()
        )));
    }

    let expected_crc = crc16(&response[..pdu_size + 1]);
    let actual_crc = u16::from_le_bytes([response[pdu_size + 1], response[pdu_size + 2]]);
    if expected_crc != actual_crc {
        return Err(BusError::crc_mismatch(expected_crc, actual_crc));
    }

    if response[0] != request[0] {
        return Err(BusError::protocol(format!(
            "slave id mismatch: sent {}, got {}",
            request[0], response[0]
        )));
    }

    if response[1] & !EXCEPTION_BIT != request_function {
        return Err(BusError::protocol(format!(
            "function code mismatch: sent 0x{:02X}, got 0x{:02X}",
            request_function, response[1]
        )));
    }

    if is_exception {
        return Ok(ResponsePayload::Exception(response[2]));
    }

    if FunctionCode::from_u8(request_function)?.is_read_function() {
        let byte_count = response[2] as usize;
        Ok(ResponsePayload::Read(response[3..3 + byte_count].to_vec()))
    } else {
        Ok(ResponsePayload::Write)
    }
}
