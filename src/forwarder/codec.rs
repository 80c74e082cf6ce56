use thiserror::Error;

/// Port value carried by the control registration frame.
pub const CONTROL_PORT: u16 = 0;

pub const REGISTRATION_FRAME_LEN: usize = 10;
#[cfg(test)]
pub const MAX_REGISTRY_JSON_BYTES: usize = u16::MAX as usize;

/// Fewer bytes were available than the field being decoded requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("framing: need {needed} bytes, got {got}")]
pub struct FramingError {
    pub needed: usize,
    pub got: usize,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_u16(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

pub fn decode_u16(b: &[u8]) -> Result<u16, FramingError> {
    let Some(head) = b.get(..2) else {
        return Err(FramingError { needed: 2, got: b.len() });
    };
    let mut out = [0u8; 2];
    out.copy_from_slice(head);
    Ok(u16::from_be_bytes(out))
}

pub fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn decode_u64(b: &[u8]) -> Result<u64, FramingError> {
    let Some(head) = b.get(..8) else {
        return Err(FramingError { needed: 8, got: b.len() });
    };
    let mut out = [0u8; 8];
    out.copy_from_slice(head);
    Ok(u64::from_be_bytes(out))
}

/// `u16(port) ++ u64(secret)`.
///
/// With `CONTROL_PORT` this marks the control connection; with a real port it
/// binds a freshly dialed tunnel connection to that port.
pub fn registration_frame(port: u16, secret: u64) -> [u8; REGISTRATION_FRAME_LEN] {
    let mut out = [0u8; REGISTRATION_FRAME_LEN];
    out[..2].copy_from_slice(&encode_u16(port));
    out[2..].copy_from_slice(&encode_u64(secret));
    out
}

/// Splits a registration frame back into `(port, secret)`.
#[cfg(test)]
pub fn parse_registration_frame(b: &[u8]) -> Result<(u16, u64), FramingError> {
    if b.len() < REGISTRATION_FRAME_LEN {
        return Err(FramingError {
            needed: REGISTRATION_FRAME_LEN,
            got: b.len(),
        });
    }
    Ok((decode_u16(b)?, decode_u64(&b[2..])?))
}

/// `u16(len) ++ json`. Bodies that do not fit a u16 length are rejected rather
/// than truncated.
pub fn registry_frame(json: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let n: u16 = json
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(json.len()))?;

    let mut out = Vec::with_capacity(2 + json.len());
    out.extend_from_slice(&encode_u16(n));
    out.extend_from_slice(json);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_roundtrip_full_range() {
        for x in 0..=u16::MAX {
            assert_eq!(decode_u16(&encode_u16(x)).unwrap(), x);
        }
    }

    #[test]
    fn u64_roundtrip_edges() {
        for x in [0, 1, 42, 0xff, 0x0102_0304_0506_0708, u64::MAX - 1, u64::MAX] {
            assert_eq!(decode_u64(&encode_u64(x)).unwrap(), x);
        }
    }

    #[test]
    fn big_endian_layout() {
        assert_eq!(encode_u16(8080), [0x1f, 0x90]);
        assert_eq!(encode_u64(42), [0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn undersized_input_is_a_framing_error() {
        assert_eq!(decode_u16(&[]), Err(FramingError { needed: 2, got: 0 }));
        assert_eq!(decode_u16(&[1]), Err(FramingError { needed: 2, got: 1 }));
        assert_eq!(
            decode_u64(&[1, 2, 3, 4, 5, 6, 7]),
            Err(FramingError { needed: 8, got: 7 })
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(decode_u16(&[0x1f, 0x90, 0xff]).unwrap(), 8080);
    }

    #[test]
    fn control_registration_for_secret_42() {
        let f = registration_frame(CONTROL_PORT, 42);
        assert_eq!(f, [0, 0, 0, 0, 0, 0, 0, 0, 0, 42]);
        assert_eq!(parse_registration_frame(&f).unwrap(), (0, 42));
    }

    #[test]
    fn registry_frame_prefixes_exact_length() {
        let body = br#"{"ports":[]}"#;
        let f = registry_frame(body).unwrap();
        assert_eq!(decode_u16(&f).unwrap() as usize, body.len());
        assert_eq!(&f[2..], body);
    }

    #[test]
    fn registry_frame_rejects_oversized_body() {
        let body = vec![b' '; MAX_REGISTRY_JSON_BYTES + 1];
        match registry_frame(&body) {
            Err(ProtocolError::PayloadTooLarge(n)) => assert_eq!(n, MAX_REGISTRY_JSON_BYTES + 1),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
