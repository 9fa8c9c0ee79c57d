use cachemux_core::compression::{AlgorithmChoice, CompressionConfig, Compressor};
use cachemux_core::{CacheValue, Serializer, SerializerConfig};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn leaf() -> impl Strategy<Value = CacheValue> {
    prop_oneof![
        Just(CacheValue::Undefined),
        Just(CacheValue::Null),
        any::<bool>().prop_map(CacheValue::Bool),
        any::<i64>().prop_map(CacheValue::Integer),
        any::<f64>().prop_map(CacheValue::Number),
        any::<u64>().prop_map(|bits| CacheValue::Number(f64::from_bits(bits))),
        Just(CacheValue::Number(f64::NAN)),
        Just(CacheValue::Number(f64::INFINITY)),
        Just(CacheValue::Number(f64::NEG_INFINITY)),
        ".{0,24}".prop_map(CacheValue::String),
        any::<i64>().prop_map(|nanos| CacheValue::Date(Utc.timestamp_nanos(nanos))),
        ("[a-z]{0,8}", "[gimsuy]{0,3}")
            .prop_map(|(source, flags)| CacheValue::RegExp { source, flags }),
        ("[A-Za-z]{1,10}", ".{0,16}")
            .prop_map(|(name, message)| CacheValue::Error { name, message }),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(CacheValue::Bytes),
    ]
}

fn value() -> impl Strategy<Value = CacheValue> {
    leaf().prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(CacheValue::Array),
            prop::collection::vec(inner.clone(), 0..6).prop_map(CacheValue::Set),
            prop::collection::vec((inner.clone(), inner.clone()), 0..4).prop_map(CacheValue::Map),
            prop::collection::btree_map(
                prop_oneof![Just("__cachemux_type".to_string()), "[a-z_]{1,8}"],
                inner,
                0..5
            )
            .prop_map(|m: BTreeMap<String, CacheValue>| CacheValue::Object(m)),
        ]
    })
}

/// Bit-level float comparison; `CacheValue` equality treats `0.0 == -0.0`.
fn same_number_bits(a: &CacheValue, b: &CacheValue) -> bool {
    match (a, b) {
        (CacheValue::Number(x), CacheValue::Number(y)) => {
            x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan())
        }
        _ => false,
    }
}

fn serializers() -> Vec<Serializer> {
    vec![
        Serializer::new(SerializerConfig::default()),
        Serializer::new(
            SerializerConfig::default()
                .with_compression(CompressionConfig::default().with_threshold(0)),
        ),
        Serializer::new(
            SerializerConfig::default()
                .with_compression(CompressionConfig::disabled())
                .with_checksum(false),
        ),
    ]
}

proptest! {
    #[test]
    fn prop_serialize_round_trip(v in value()) {
        for serializer in serializers() {
            let payload = serializer.serialize(&v).unwrap();
            prop_assert_eq!(payload.metadata.size, payload.data.len());
            prop_assert_eq!(serializer.deserialize(&payload).unwrap(), v.clone());
        }
    }

    #[test]
    fn prop_any_float_round_trips_exactly(bits in any::<u64>()) {
        let value = CacheValue::Number(f64::from_bits(bits));
        for serializer in serializers() {
            let back = serializer.deserialize(&serializer.serialize(&value).unwrap()).unwrap();
            prop_assert!(same_number_bits(&back, &value), "{:?} came back as {:?}", value, back);
        }
    }

    #[test]
    fn prop_compression_never_grows_and_restores(
        data in prop_oneof![
            prop::collection::vec(any::<u8>(), 0..4096),
            // Highly repetitive input
            (any::<u8>(), 0usize..8192).prop_map(|(b, n)| vec![b; n]),
        ],
        choice in prop_oneof![
            Just(AlgorithmChoice::Auto),
            Just(AlgorithmChoice::Lz4),
            Just(AlgorithmChoice::Gzip),
        ],
    ) {
        let compressor = Compressor::new(
            CompressionConfig::default().with_threshold(0).with_algorithm(choice),
        );
        let compressed = compressor.compress_if_needed(data.clone());
        prop_assert!(compressed.data.len() <= data.len());
        prop_assert_eq!(compressed.original_size, data.len());

        let restored = compressor
            .decompress_if_needed(&compressed.data, compressed.algorithm)
            .unwrap();
        prop_assert_eq!(restored.as_ref(), data.as_slice());
    }
}
