// Consistent Overhead Byte Stuffing
//
// Removes every zero byte from a frame so that a single 0x00 can terminate it
// on the wire. Each block starts with a code byte giving the distance to the
// next (elided) zero.

/// Frame terminator on the wire
pub const DELIMITER: u8 = 0x00;

/// Longest run a single code byte can describe
const MAX_BLOCK: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StuffingError {
    #[error("Zero byte inside stuffed data at offset {offset}")]
    UnexpectedZero { offset: usize },

    #[error("Block at offset {offset} runs past the end of the frame")]
    Truncated { offset: usize },
}

/// Stuff `data`. The result contains no zero byte and no terminator.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_index = 0;
    let mut code = 1u8;
    out.push(0);

    for &byte in data {
        if byte == 0 {
            out[code_index] = code;
            code_index = out.len();
            out.push(0);
            code = 1;
            continue;
        }

        out.push(byte);
        code += 1;
        if code == MAX_BLOCK {
            out[code_index] = code;
            code_index = out.len();
            out.push(0);
            code = 1;
        }
    }

    out[code_index] = code;
    out
}

/// Stuff `data` and append the frame terminator
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut out = encode(data);
    out.push(DELIMITER);
    out
}

/// Reverse `encode`. `data` must not include the terminator.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, StuffingError> {
    let mut out = Vec::with_capacity(data.len());
    let mut offset = 0;

    while offset < data.len() {
        let code = data[offset];
        if code == 0 {
            return Err(StuffingError::UnexpectedZero { offset });
        }

        let end = offset + code as usize;
        if end > data.len() {
            return Err(StuffingError::Truncated { offset });
        }

        let block = &data[offset + 1..end];
        if let Some(position) = block.iter().position(|&b| b == 0) {
            return Err(StuffingError::UnexpectedZero {
                offset: offset + 1 + position,
            });
        }
        out.extend_from_slice(block);

        offset = end;
        if code != MAX_BLOCK && offset < data.len() {
            out.push(0);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(encode(&[]), vec![0x01]);
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(encode(&[0x11, 0x22, 0x00, 0x33]), vec![0x03, 0x11, 0x22, 0x02, 0x33]);
        assert_eq!(encode(&[0x11, 0x00]), vec![0x02, 0x11, 0x01]);
    }

    #[test]
    fn test_decode_known_vectors() {
        assert_eq!(decode(&[0x03, 0x11, 0x22, 0x02, 0x33]).unwrap(), vec![0x11, 0x22, 0x00, 0x33]);
        assert_eq!(decode(&[0x02, 0x11, 0x01]).unwrap(), vec![0x11, 0x00]);
    }

    #[test]
    fn test_stuffed_output_has_no_zero() {
        let data: Vec<u8> = (0..600u32).map(|i| (i % 7) as u8).collect();
        let stuffed = encode(&data);

        assert!(!stuffed.contains(&0));
        assert_eq!(decode(&stuffed).unwrap(), data);
    }

    #[test]
    fn test_long_run_without_zero() {
        let data = vec![0xAB; 300];
        let stuffed = encode(&data);

        assert_eq!(stuffed[0], 0xFF);
        assert_eq!(decode(&stuffed).unwrap(), data);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(
            decode(&[0x05, 0x11, 0x22]),
            Err(StuffingError::Truncated { offset: 0 })
        );
        assert_eq!(
            decode(&[0x03, 0x11, 0x00]),
            Err(StuffingError::UnexpectedZero { offset: 2 })
        );
    }
}
