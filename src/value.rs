/// Register value formats and wire packing
///
/// Raw register content travels through the crate as a `u64` holding up
/// to four 16-bit elements. This module maps between that raw form, the
/// on-wire element sequence (in the configured word order) and the text
/// form published to the consumer.
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Order of 16-bit elements inside a multi-element value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Most significant word at the lowest address
    #[default]
    BigEndian,
    /// Least significant word at the lowest address
    LittleEndian,
}

/// Numeric interpretation of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    /// Unsigned, width taken from the descriptor
    #[default]
    Auto,
    U8,
    S8,
    U16,
    S16,
    U24,
    S24,
    U32,
    S32,
    U64,
    S64,
    Bcd8,
    Bcd16,
    Bcd24,
    Bcd32,
    Float,
    Double,
    Char8,
}

impl RegisterFormat {
    /// Payload width of the format in bytes
    pub fn byte_width(self) -> u8 {
        match self {
            RegisterFormat::U8 | RegisterFormat::S8 | RegisterFormat::Bcd8 | RegisterFormat::Char8 => 1,
            RegisterFormat::Auto | RegisterFormat::U16 | RegisterFormat::S16 | RegisterFormat::Bcd16 => 2,
            RegisterFormat::U24 | RegisterFormat::S24 | RegisterFormat::Bcd24 => 3,
            RegisterFormat::U32 | RegisterFormat::S32 | RegisterFormat::Bcd32 | RegisterFormat::Float => 4,
            RegisterFormat::U64 | RegisterFormat::S64 | RegisterFormat::Double => 8,
        }
    }

    /// Number of 16-bit elements needed to carry the format
    pub fn element_count(self) -> u16 {
        ((self.byte_width() as u16) + 1) / 2
    }

    /// Render a raw value into its published text form
    pub fn render(self, raw: u64) -> String {
        match self {
            RegisterFormat::Auto | RegisterFormat::U16 => (raw as u16).to_string(),
            RegisterFormat::U8 => (raw as u8).to_string(),
            RegisterFormat::S8 => (raw as u8 as i8).to_string(),
            RegisterFormat::S16 => (raw as u16 as i16).to_string(),
            RegisterFormat::U24 => (raw as u32 & 0x00FF_FFFF).to_string(),
            RegisterFormat::S24 => (((raw as u32) << 8) as i32 >> 8).to_string(),
            RegisterFormat::U32 => (raw as u32).to_string(),
            RegisterFormat::S32 => (raw as u32 as i32).to_string(),
            RegisterFormat::U64 => raw.to_string(),
            RegisterFormat::S64 => (raw as i64).to_string(),
            RegisterFormat::Bcd8 => bcd_to_u64(raw & 0xFF).to_string(),
            RegisterFormat::Bcd16 => bcd_to_u64(raw & 0xFFFF).to_string(),
            RegisterFormat::Bcd24 => bcd_to_u64(raw & 0x00FF_FFFF).to_string(),
            RegisterFormat::Bcd32 => bcd_to_u64(raw & 0xFFFF_FFFF).to_string(),
            RegisterFormat::Float => f32::from_bits(raw as u32).to_string(),
            RegisterFormat::Double => f64::from_bits(raw).to_string(),
            RegisterFormat::Char8 => ((raw as u8) as char).to_string(),
        }
    }

    /// Parse text back into the raw wire value
    pub fn parse(self, text: &str) -> BusResult<u64> {
        let text = text.trim();
        fn bad<E>(text: &str, format: RegisterFormat) -> impl FnOnce(E) -> BusError + '_ {
            move |_| BusError::invalid_data(format!("cannot parse '{}' as {:?}", text, format))
        }
        match self {
            RegisterFormat::Auto
            | RegisterFormat::U8
            | RegisterFormat::U16
            | RegisterFormat::U24
            | RegisterFormat::U32
            | RegisterFormat::U64 => text.parse::<u64>().map_err(bad(text, self)),
            RegisterFormat::S8 | RegisterFormat::S16 | RegisterFormat::S24 | RegisterFormat::S32 | RegisterFormat::S64 => {
                let v = text.parse::<i64>().map_err(bad(text, self))?;
                let mask = match self {
                    RegisterFormat::S8 => 0xFF,
                    RegisterFormat::S16 => 0xFFFF,
                    RegisterFormat::S24 => 0x00FF_FFFF,
                    RegisterFormat::S32 => 0xFFFF_FFFF,
                    _ => u64::MAX,
                };
                Ok((v as u64) & mask)
            }
            RegisterFormat::Bcd8 | RegisterFormat::Bcd16 | RegisterFormat::Bcd24 | RegisterFormat::Bcd32 => {
                let v = text.parse::<u64>().map_err(bad(text, self))?;
                u64_to_bcd(v, self.byte_width())
            }
            RegisterFormat::Float => {
                let v = text.parse::<f32>().map_err(bad(text, self))?;
                Ok(v.to_bits() as u64)
            }
            RegisterFormat::Double => {
                let v = text.parse::<f64>().map_err(bad(text, self))?;
                Ok(v.to_bits())
            }
            RegisterFormat::Char8 => {
                let c = text.chars().next().ok_or_else(|| {
                    BusError::invalid_data("empty text for char8 register".to_string())
                })?;
                Ok(c as u64 & 0xFF)
            }
        }
    }
}

/// Combine consecutive 16-bit elements into a raw value
///
/// `words` is in address order; the word order decides which end is the
/// most significant.
pub fn words_to_raw(words: &[u16], order: WordOrder) -> u64 {
    debug_assert!(words.len() <= 4);
    match order {
        WordOrder::BigEndian => words
            .iter()
            .fold(0u64, |acc, &w| (acc << 16) | u64::from(w)),
        WordOrder::LittleEndian => words
            .iter()
            .rev()
            .fold(0u64, |acc, &w| (acc << 16) | u64::from(w)),
    }
}

/// Split a raw value into `count` 16-bit elements in address order
pub fn raw_to_words(raw: u64, count: u16, order: WordOrder) -> Vec<u16> {
    debug_assert!((1..=4).contains(&count));
    let mut words: Vec<u16> = (0..count)
        .rev()
        .map(|i| (raw >> (16 * i)) as u16)
        .collect();
    if order == WordOrder::LittleEndian {
        words.reverse();
    }
    words
}

/// Split a read-response payload into big-endian 16-bit elements
pub fn words_from_payload(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Extract one bit from an LSB-first packed bit payload
pub fn bit_from_payload(payload: &[u8], index: usize) -> bool {
    payload
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// Decode a packed-BCD value into its plain numeric value
pub fn bcd_to_u64(mut bcd: u64) -> u64 {
    let mut value = 0u64;
    let mut scale = 1u64;
    while bcd != 0 {
        value += (bcd & 0xF) * scale;
        scale *= 10;
        bcd >>= 4;
    }
    value
}

/// Encode a plain numeric value as packed BCD of the given byte width
pub fn u64_to_bcd(mut value: u64, bytes: u8) -> BusResult<u64> {
    let original = value;
    let mut bcd = 0u64;
    let mut shift = 0u32;
    while value != 0 {
        if shift >= u32::from(bytes) * 8 {
            return Err(BusError::invalid_data(format!(
                "{} does not fit into {} BCD byte(s)",
                original, bytes
            )));
        }
        bcd |= (value % 10) << shift;
        value /= 10;
        shift += 4;
    }
    Ok(bcd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order() {
        let words = [0x0102, 0x0304, 0x0506, 0x0708];
        assert_eq!(words_to_raw(&words, WordOrder::BigEndian), 0x0102_0304_0506_0708);
        assert_eq!(words_to_raw(&words, WordOrder::LittleEndian), 0x0708_0506_0304_0102);

        assert_eq!(
            raw_to_words(0x0102_0304_0506_0708, 4, WordOrder::BigEndian),
            words.to_vec()
        );
        assert_eq!(
            raw_to_words(0x0708_0506_0304_0102, 4, WordOrder::LittleEndian),
            words.to_vec()
        );
        assert_eq!(raw_to_words(0x15, 1, WordOrder::BigEndian), vec![0x15]);
    }

    #[test]
    fn test_payload_helpers() {
        let payload = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(words_from_payload(&payload), vec![0x1234, 0x5678]);

        let bits = [0b0000_0110, 0b0000_0001];
        assert!(!bit_from_payload(&bits, 0));
        assert!(bit_from_payload(&bits, 1));
        assert!(bit_from_payload(&bits, 2));
        assert!(bit_from_payload(&bits, 8));
        assert!(!bit_from_payload(&bits, 9));
        assert!(!bit_from_payload(&bits, 40));
    }

    #[test]
    fn test_signed_rendering() {
        assert_eq!(RegisterFormat::S16.render(0xFFFF), "-1");
        assert_eq!(RegisterFormat::S16.render(0x7FFF), "32767");
        assert_eq!(RegisterFormat::S8.render(0x80), "-128");
        assert_eq!(RegisterFormat::S24.render(0x00FF_FFFE), "-2");
        assert_eq!(RegisterFormat::S32.render(0xFFFF_FFFF), "-1");
        assert_eq!(RegisterFormat::S64.render(u64::MAX), "-1");
        assert_eq!(RegisterFormat::U16.render(0xFFFF), "65535");
    }

    #[test]
    fn test_float_round_trip() {
        let raw = RegisterFormat::Float.parse("-2.75").unwrap();
        assert_eq!(raw, (-2.75f32).to_bits() as u64);
        assert_eq!(RegisterFormat::Float.render(raw), "-2.75");

        let raw = RegisterFormat::Double.parse("123.5").unwrap();
        assert_eq!(RegisterFormat::Double.render(raw), "123.5");
    }

    #[test]
    fn test_bcd() {
        assert_eq!(bcd_to_u64(0x1234), 1234);
        assert_eq!(u64_to_bcd(1234, 2).unwrap(), 0x1234);
        assert_eq!(RegisterFormat::Bcd16.render(0x0099), "99");
        assert_eq!(RegisterFormat::Bcd16.parse("9999").unwrap(), 0x9999);
        assert!(u64_to_bcd(100, 1).is_err());
    }

    #[test]
    fn test_element_counts() {
        assert_eq!(RegisterFormat::U16.element_count(), 1);
        assert_eq!(RegisterFormat::U24.element_count(), 2);
        assert_eq!(RegisterFormat::Float.element_count(), 2);
        assert_eq!(RegisterFormat::S64.element_count(), 4);
        assert_eq!(RegisterFormat::U8.element_count(), 1);
    }

    #[test]
    fn test_parse_signed_masks_width() {
        assert_eq!(RegisterFormat::S16.parse("-1").unwrap(), 0xFFFF);
        assert_eq!(RegisterFormat::S32.parse("-1").unwrap(), 0xFFFF_FFFF);
        assert_eq!(RegisterFormat::S64.parse("-1").unwrap(), u64::MAX);
    }
}
