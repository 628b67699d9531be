//! Property tests for the frame codec

use bytes::BytesMut;
use proptest::prelude::*;
use ws_tether::frame::{Decode, FrameDecoder, OpCode, encode_frame};

/// Payload lengths on either side of each length-encoding boundary
const BOUNDARY_LENGTHS: [usize; 7] = [0, 1, 125, 126, 127, 65535, 65536];

fn data_opcode() -> impl Strategy<Value = OpCode> {
    prop_oneof![Just(OpCode::Text), Just(OpCode::Binary)]
}

fn encode(opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, usize::MAX, opcode, payload, mask).unwrap();
    buf
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn boundary_lengths_survive_masking(
        idx in 0..BOUNDARY_LENGTHS.len(),
        opcode in data_opcode(),
        mask in any::<[u8; 4]>(),
        fill in any::<u8>(),
    ) {
        let payload = vec![fill; BOUNDARY_LENGTHS[idx]];
        let wire = encode(opcode, &payload, Some(mask));

        let frames = FrameDecoder::new(usize::MAX).decode_all(&wire).unwrap();
        prop_assert_eq!(frames.len(), 1);
        prop_assert!(frames[0].fin);
        prop_assert!(frames[0].masked);
        prop_assert_eq!(frames[0].mask_key, mask);
        prop_assert_eq!(frames[0].opcode, opcode);
        prop_assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn chunk_boundaries_do_not_matter(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..6),
        chunk in 1usize..64,
    ) {
        let mut wire = BytesMut::new();
        for payload in &payloads {
            encode_frame(&mut wire, usize::MAX, OpCode::Binary, payload, None).unwrap();
        }

        let mut decoder = FrameDecoder::new(usize::MAX);
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            decoded.extend(decoder.decode_all(piece).unwrap());
        }

        prop_assert!(decoder.is_idle());
        prop_assert_eq!(decoded.len(), payloads.len());
        for (frame, payload) in decoded.iter().zip(&payloads) {
            prop_assert_eq!(&frame.payload[..], &payload[..]);
        }
    }

    #[test]
    fn bytewise_matches_bulk(
        payload in prop::collection::vec(any::<u8>(), 0..1024),
        mask in any::<[u8; 4]>(),
    ) {
        let wire = encode(OpCode::Text, &payload, Some(mask));

        let mut decoder = FrameDecoder::new(usize::MAX);
        let mut frame = None;
        for (i, &byte) in wire.iter().enumerate() {
            match decoder.decode(byte).unwrap() {
                Decode::NeedMore => prop_assert!(i + 1 < wire.len()),
                Decode::Frame(f) => {
                    prop_assert_eq!(i + 1, wire.len());
                    frame = Some(f);
                }
            }
        }

        let bulk = FrameDecoder::new(usize::MAX).decode_all(&wire).unwrap();
        prop_assert_eq!(Some(&bulk[0]), frame.as_ref());
    }

    #[test]
    fn oversized_frames_are_rejected(len in 11usize..2048) {
        let wire = encode(OpCode::Binary, &vec![0u8; len], None);
        prop_assert!(FrameDecoder::new(10).decode_all(&wire).is_err());
    }
}
