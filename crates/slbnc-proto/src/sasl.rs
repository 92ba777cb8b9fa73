//! SASL helpers for the PLAIN and EXTERNAL mechanisms.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

/// AUTHENTICATE payloads are chunked at this size on the wire.
pub const AUTHENTICATE_CHUNK_LEN: usize = 400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaslError {
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("malformed PLAIN response")]
    MalformedPlain,
}

/// Encode a PLAIN initial response: `authzid NUL authcid NUL password`.
pub fn encode_plain(authzid: &str, authcid: &str, password: &str) -> String {
    let payload = format!("{}\0{}\0{}", authzid, authcid, password);
    BASE64.encode(payload.as_bytes())
}

/// Decode a PLAIN response into `(authzid, authcid, password)`.
pub fn decode_plain(payload: &[u8]) -> Result<(String, String, String), SaslError> {
    let mut parts = payload.split(|&b| b == 0);
    let mut field = || {
        parts
            .next()
            .and_then(|p| String::from_utf8(p.to_vec()).ok())
            .ok_or(SaslError::MalformedPlain)
    };
    let authzid = field()?;
    let authcid = field()?;
    let password = field()?;
    if parts.next().is_some() {
        return Err(SaslError::MalformedPlain);
    }
    Ok((authzid, authcid, password))
}

/// Decode one AUTHENTICATE parameter: `+` is the empty payload.
pub fn decode_authenticate_param(param: &str) -> Result<Vec<u8>, SaslError> {
    if param == "+" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(param.as_bytes())
        .map_err(|_| SaslError::InvalidBase64)
}

/// Encode a response into AUTHENTICATE parameters, chunked at 400 bytes.
///
/// An empty response is the single parameter `+`; a response whose base64
/// form is an exact multiple of the chunk size is terminated by a `+`.
pub fn encode_authenticate_params(resp: &[u8]) -> Vec<String> {
    if resp.is_empty() {
        return vec!["+".to_owned()];
    }
    let encoded = BASE64.encode(resp);
    let mut params: Vec<String> = encoded
        .as_bytes()
        .chunks(AUTHENTICATE_CHUNK_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if encoded.len() % AUTHENTICATE_CHUNK_LEN == 0 {
        params.push("+".to_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let encoded = encode_plain("", "user", "hunter2");
        let decoded = decode_authenticate_param(&encoded).unwrap();
        assert_eq!(
            decode_plain(&decoded).unwrap(),
            ("".to_owned(), "user".to_owned(), "hunter2".to_owned())
        );
    }

    #[test]
    fn plain_rejects_extra_fields() {
        assert_eq!(
            decode_plain(b"a\0b\0c\0d"),
            Err(SaslError::MalformedPlain)
        );
    }

    #[test]
    fn empty_response_is_plus() {
        assert_eq!(encode_authenticate_params(b""), vec!["+"]);
        assert_eq!(decode_authenticate_param("+").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn long_response_is_chunked() {
        let resp = vec![b'x'; 600];
        let params = encode_authenticate_params(&resp);
        assert!(params.len() >= 2);
        assert!(params[..params.len() - 1]
            .iter()
            .all(|p| p.len() == AUTHENTICATE_CHUNK_LEN));

        let joined: String = params.join("");
        let decoded = decode_authenticate_param(joined.trim_end_matches('+')).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn exact_multiple_gets_plus_terminator() {
        // 300 bytes encode to exactly 400 base64 characters.
        let resp = vec![b'y'; 300];
        let params = encode_authenticate_params(&resp);
        assert_eq!(params.len(), 2);
        assert_eq!(params[1], "+");
    }
}
