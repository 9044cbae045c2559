use std::sync::Arc;

use super::*;

fn sample() -> Vec<u8> {
    let mut raw = Vec::new();
    for i in 0..200u32 {
        raw.extend_from_slice(format!("key-{i:05}=value-{i:05};").as_bytes());
    }
    raw
}

#[test]
fn identity_is_passthrough() {
    let raw = sample();
    let packed = IdentityCodec.compress(&raw).unwrap();
    assert_eq!(packed, raw);
    assert_eq!(IdentityCodec.decompress(&packed, raw.len()).unwrap(), raw);
}

#[test]
fn snappy_shrinks_repetitive_data() {
    let raw = sample();
    let packed = SnappyCodec.compress(&raw).unwrap();
    assert!(packed.len() < raw.len() / 2, "{} vs {}", packed.len(), raw.len());
    assert_eq!(SnappyCodec.decompress(&packed, raw.len()).unwrap(), raw);
}

#[test]
fn snappy_handles_empty_input() {
    let packed = SnappyCodec.compress(&[]).unwrap();
    assert!(SnappyCodec.decompress(&packed, 0).unwrap().is_empty());
}

#[test]
fn wrong_expected_size_is_rejected() {
    let raw = sample();
    let packed = SnappyCodec.compress(&raw).unwrap();
    let err = SnappyCodec.decompress(&packed, raw.len() + 1).unwrap_err();
    assert!(matches!(err, CodecError::SizeMismatch { .. }));

    let err = IdentityCodec.decompress(&raw, raw.len() - 1).unwrap_err();
    assert!(matches!(err, CodecError::SizeMismatch { .. }));
}

#[test]
fn snappy_garbage_input_fails() {
    // Varint header claims 5 bytes, body is not a valid element stream.
    let garbage = [0x05, 0xFF, 0xFF, 0xFF];
    assert!(SnappyCodec.decompress(&garbage, 5).is_err());
}

#[test]
fn default_registry_resolves_builtins() {
    let registry = CodecRegistry::default();
    assert_eq!(registry.resolve(IDENTITY_CODEC_ID).unwrap().name(), "identity");
    assert_eq!(registry.resolve(SNAPPY_CODEC_ID).unwrap().name(), "snappy");
    assert!(matches!(
        registry.resolve(42).unwrap_err(),
        CodecError::UnknownCodec(42)
    ));
}

#[derive(Debug)]
struct Reversing;

impl BlockCodec for Reversing {
    fn id(&self) -> u8 {
        42
    }
    fn name(&self) -> &'static str {
        "reversing"
    }
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(raw.iter().rev().copied().collect())
    }
    fn decompress(&self, data: &[u8], _expected_size: usize) -> Result<Vec<u8>, CodecError> {
        Ok(data.iter().rev().copied().collect())
    }
}

#[test]
fn custom_codec_can_be_registered() {
    let mut registry = CodecRegistry::identity_only();
    assert!(!registry.contains(42));
    assert!(!registry.contains(SNAPPY_CODEC_ID));
    registry.register(Arc::new(Reversing));
    let codec = registry.resolve(42).unwrap();
    assert_eq!(codec.decompress(&codec.compress(b"abc").unwrap(), 3).unwrap(), b"abc");
}
