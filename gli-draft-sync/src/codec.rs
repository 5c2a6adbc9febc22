//! Pluggable payload codecs.
//!
//! The backup pipeline runs a compression codec followed by an encryption
//! codec. Both are injected at construction so the archive logic does not
//! depend on any particular algorithm.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("{codec} encode failed: {reason}")]
    Encode { codec: &'static str, reason: String },
    #[error("{codec} decode failed: {reason}")]
    Decode { codec: &'static str, reason: String },
}

/// Reversible byte transformation.
pub trait Codec: Send + Sync {
    /// Short identifier recorded alongside encoded payloads.
    fn name(&self) -> &'static str;

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Pass-through codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(input.to_vec())
    }

    fn decode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(input.to_vec())
    }
}

/// LZ4 block compression with the original size prepended.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(input))
    }

    fn decode(&self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(input).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_passthrough() {
        let codec = IdentityCodec;
        let data = b"contract".to_vec();
        assert_eq!(codec.encode(&data).unwrap(), data);
        assert_eq!(codec.decode(&data).unwrap(), data);
    }

    #[test]
    fn test_lz4_shrinks_repetitive_json() {
        let codec = Lz4Codec;
        let json = r#"{"property":{"address":"Calle Mayor 1"}},"#.repeat(200);
        let encoded = codec.encode(json.as_bytes()).unwrap();
        assert!(encoded.len() * 5 < json.len());
        assert_eq!(codec.decode(&encoded).unwrap(), json.as_bytes());
    }

    #[test]
    fn test_lz4_rejects_garbage() {
        let err = Lz4Codec.decode(&[10, 0, 0, 0, 0xF0]).unwrap_err();
        assert!(matches!(err, CodecError::Decode { codec: "lz4", .. }));
    }
}
