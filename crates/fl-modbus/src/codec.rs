//! Register decoding
//!
//! Turns the 16-bit words a Modbus read returns into the `raw_value` the rest
//! of the pipeline carries. 32-bit quantities are combined low word first,
//! which is how ADAM-series counter modules lay them out.

use fl_config::DataType;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} registers for {data_type:?}, got {actual}")]
    WordCount {
        data_type: DataType,
        expected: usize,
        actual: usize,
    },
}

/// Combine two words into a 32-bit value, low word first.
fn combine_le(words: &[u16]) -> u32 {
    ((words[1] as u32) << 16) | words[0] as u32
}

/// Decode a register read into a raw pipeline value.
///
/// Float32 is stored as its IEEE bit pattern; `DataType::f64_from_raw`
/// recovers the numeric value downstream.
pub fn decode_registers(words: &[u16], data_type: DataType) -> Result<i64, CodecError> {
    let expect = |expected: usize| -> Result<(), CodecError> {
        if words.len() == expected {
            Ok(())
        } else {
            Err(CodecError::WordCount {
                data_type,
                expected,
                actual: words.len(),
            })
        }
    };

    match data_type {
        DataType::UInt32Counter => {
            // Counter channels may be configured single-width on devices that
            // expose 16-bit counters.
            match words.len() {
                1 => Ok(words[0] as i64),
                2 => Ok(combine_le(words) as i64),
                actual => Err(CodecError::WordCount {
                    data_type,
                    expected: 2,
                    actual,
                }),
            }
        }
        DataType::UInt16 => {
            expect(1)?;
            Ok(words[0] as i64)
        }
        DataType::Int16 => {
            expect(1)?;
            Ok(words[0] as i16 as i64)
        }
        DataType::Int32 => {
            expect(2)?;
            Ok(combine_le(words) as i32 as i64)
        }
        DataType::Float32 => {
            expect(2)?;
            Ok(combine_le(words) as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_combines_low_word_first() {
        // 0x0001_0002 = 65538, stored as [low, high]
        assert_eq!(
            decode_registers(&[0x0002, 0x0001], DataType::UInt32Counter).unwrap(),
            65538
        );
    }

    #[test]
    fn single_width_counter_passes_through() {
        assert_eq!(
            decode_registers(&[0xFFFF], DataType::UInt32Counter).unwrap(),
            u16::MAX as i64
        );
    }

    #[test]
    fn counter_near_wrap_is_unsigned() {
        assert_eq!(
            decode_registers(&[0xFFFF, 0xFFFF], DataType::UInt32Counter).unwrap(),
            u32::MAX as i64
        );
    }

    #[test]
    fn int16_is_sign_extended() {
        assert_eq!(decode_registers(&[0xFFFE], DataType::Int16).unwrap(), -2);
        assert_eq!(decode_registers(&[0x7FFF], DataType::Int16).unwrap(), 32767);
    }

    #[test]
    fn int32_is_sign_extended() {
        assert_eq!(
            decode_registers(&[0xFFFF, 0xFFFF], DataType::Int32).unwrap(),
            -1
        );
    }

    #[test]
    fn float32_round_trips_through_bits() {
        let bits = 12.5f32.to_bits();
        let words = [(bits & 0xFFFF) as u16, (bits >> 16) as u16];
        let raw = decode_registers(&words, DataType::Float32).unwrap();
        assert_eq!(DataType::Float32.f64_from_raw(raw), 12.5);
    }

    #[test]
    fn word_count_mismatch_is_an_error() {
        let err = decode_registers(&[1, 2], DataType::UInt16).unwrap_err();
        assert!(matches!(err, CodecError::WordCount { actual: 2, .. }));
        assert!(decode_registers(&[], DataType::UInt32Counter).is_err());
    }
}
