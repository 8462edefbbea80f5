//! Codec behaviour on bodies a peer should never send
//!
//! The receiver decodes whatever arrives on the wire, so malformed or
//! oversized bodies must come back as `CodecError::Decode` and never panic.

use codec::encoding::MAX_DECOMPRESSED_SIZE;
use codec::{batch_decode, decode_payload, CodecError, ContentEncoding};
use flate2::write::GzEncoder;
use flate2::Compression;
use proptest::prelude::*;
use std::io::Write;

const ALL: [ContentEncoding; 4] = [
    ContentEncoding::Json,
    ContentEncoding::Binary,
    ContentEncoding::JsonGzip,
    ContentEncoding::BinaryGzip,
];

#[test]
fn test_gzip_bomb_is_rejected() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let chunk = vec![0u8; 1024 * 1024];
    let mut written = 0u64;
    while written <= MAX_DECOMPRESSED_SIZE {
        encoder.write_all(&chunk).unwrap();
        written += chunk.len() as u64;
    }
    let bomb = encoder.finish().unwrap();
    assert!((bomb.len() as u64) < MAX_DECOMPRESSED_SIZE / 100);

    let err = decode_payload(&bomb, ContentEncoding::JsonGzip).unwrap_err();
    assert!(matches!(err, CodecError::Decode { .. }));
    assert!(err.to_string().contains("exceeds"));
}

#[test]
fn test_empty_body() {
    for codec in ALL {
        assert!(batch_decode(&[], codec).is_err(), "codec {}", codec);
    }
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        for codec in ALL {
            if let Err(err) = batch_decode(&data, codec) {
                prop_assert_eq!(err.category(), "decode");
            }
            let _ = decode_payload(&data, codec);
        }
    }
}
