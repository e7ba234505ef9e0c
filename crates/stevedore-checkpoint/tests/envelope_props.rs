//! Property tests for the checkpoint envelope.

use std::collections::BTreeMap;

use chrono::Utc;
use proptest::prelude::*;
use stevedore_checkpoint::{CheckpointEnvelope, Compression, RestorePolicy};

fn compression_strategy() -> impl Strategy<Value = Compression> {
    prop_oneof![
        Just(Compression::None),
        (1i32..=19).prop_map(|level| Compression::Zstd { level }),
    ]
}

/// Payloads ranging from incompressible noise to highly repetitive JSON.
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..2048),
        ("[a-z_]{1,12}", 1usize..400).prop_map(|(word, n)| {
            format!("{{\"stages\":[{}]}}", vec![format!("\"{word}\""); n].join(","))
                .into_bytes()
        }),
    ]
}

proptest! {
    /// A sealed payload always opens to the same bytes.
    #[test]
    fn sealed_payload_opens_unchanged(
        payload in payload_strategy(),
        compression in compression_strategy(),
        integrity in any::<bool>(),
    ) {
        let envelope =
            CheckpointEnvelope::seal(&payload, compression, integrity, Utc::now(), BTreeMap::new())
                .unwrap();
        let opened = envelope.open(RestorePolicy::Strict, "prop").unwrap();
        prop_assert_eq!(opened, payload);
    }

    /// Compression is only kept when it shrinks the payload.
    #[test]
    fn compressed_data_is_smaller(
        payload in payload_strategy(),
        compression in compression_strategy(),
    ) {
        let envelope =
            CheckpointEnvelope::seal(&payload, compression, true, Utc::now(), BTreeMap::new())
                .unwrap();
        prop_assert_eq!(envelope.data_size, payload.len() as u64);
        if envelope.compressed {
            prop_assert!((envelope.data.len() as u64) < envelope.data_size);
        } else {
            prop_assert_eq!(&envelope.data, &payload);
        }
    }
}
