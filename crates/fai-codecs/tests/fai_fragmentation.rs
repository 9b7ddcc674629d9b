//! FAI 成帧的分片无关性、校验和往返与单比特翻转检测。

use bytes::{Bytes, BytesMut};
use fai_codecs::fai::{FaiCodec, FaiFrame, FaiFrameFilter, HEADER_LEN};
use fai_core::{
    Message, Session, codes,
    pipeline::FilterChain,
    test_stubs::{RecordingHandler, RecordingSession},
};
use proptest::prelude::*;

const LIMIT: usize = 64 * 1024;

fn frame_strategy() -> impl Strategy<Value = FaiFrame> {
    (
        any::<u32>(),
        any::<u16>(),
        any::<u32>(),
        any::<u16>(),
        any::<u16>(),
        proptest::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(aid, cmd, flow, result, wid, body)| FaiFrame {
            aid,
            cmd,
            flow,
            result,
            wid,
            body: Bytes::from(body),
            ..FaiFrame::default()
        })
}

fn session_with_filter() -> (RecordingSession, RecordingHandler) {
    let handler = RecordingHandler::new();
    let session = RecordingSession::new(1);
    session.attach(
        FilterChain::builder(handler.clone())
            .add_last(FaiFrameFilter::new(LIMIT))
            .build(),
    );
    (session, handler)
}

fn decoded(handler: &RecordingHandler) -> Vec<FaiFrame> {
    handler
        .take_reads()
        .into_iter()
        .map(|message| message.downcast::<FaiFrame>().expect("decoded frame"))
        .collect()
}

/// 把 `wire` 在给定切点处切开，切点取模后去重排序，保证每块非空。
fn split_at_points(wire: &[u8], points: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = points
        .iter()
        .map(|point| point % wire.len())
        .filter(|cut| *cut > 0)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(wire[start..cut].to_vec());
        start = cut;
    }
    chunks.push(wire[start..].to_vec());
    chunks
}

proptest! {
    #[test]
    fn fragmentation_does_not_change_the_decoded_frames(
        frames in proptest::collection::vec(frame_strategy(), 1..4),
        points in proptest::collection::vec(any::<usize>(), 0..16),
    ) {
        let codec = FaiCodec::new(LIMIT);
        let mut wire = BytesMut::new();
        for frame in &frames {
            codec.encode(frame, &mut wire).unwrap();
        }

        let (whole, whole_handler) = session_with_filter();
        whole.feed(&wire).unwrap();

        let (pieces, pieces_handler) = session_with_filter();
        for chunk in split_at_points(&wire, &points) {
            pieces.feed(&chunk).unwrap();
        }

        let expected = decoded(&whole_handler);
        prop_assert_eq!(&expected, &frames);
        prop_assert_eq!(decoded(&pieces_handler), expected);
        prop_assert!(!pieces.is_closed());
    }

    #[test]
    fn checksum_round_trip_and_single_bit_flips(frame in frame_strategy(), bit in 0usize..(HEADER_LEN * 8)) {
        let codec = FaiCodec::new(LIMIT);
        let wire = codec.encode_to_bytes(&frame).unwrap();
        let mut intact = BytesMut::from(&wire[..]);
        prop_assert_eq!(codec.decode(&mut intact).unwrap(), Some(frame));

        let mut corrupted = BytesMut::from(&wire[..]);
        corrupted[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(codec.decode(&mut corrupted).is_err());
    }
}

#[test]
fn forty_byte_frame_in_three_segments_decodes_once() {
    let frame = FaiFrame::request(0xA1D, 0x0C0D, 42, &b"\x01\x02\x03\x04\x05\x06\x07\x08"[..]);
    let wire = FaiCodec::new(LIMIT).encode_to_bytes(&frame).unwrap();
    assert_eq!(wire.len(), 40);

    let (session, handler) = session_with_filter();
    session.feed(&wire[..10]).unwrap();
    session.feed(&wire[10..25]).unwrap();
    assert!(decoded(&handler).is_empty());
    session.feed(&wire[25..]).unwrap();

    let frames = decoded(&handler);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].aid, 0xA1D);
    assert_eq!(frames[0].cmd, 0x0C0D);
    assert_eq!(&frames[0].body[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(!session.is_closed());
}

#[test]
fn corrupted_header_closes_without_partial_recovery() {
    let frame = FaiFrame::request(1, 2, 3, &b"payload"[..]);
    let mut wire = FaiCodec::new(LIMIT).encode_to_bytes(&frame).unwrap().to_vec();
    wire[0] = 0x00;

    let (session, handler) = session_with_filter();
    let err = session.feed(&wire).unwrap_err();
    assert_eq!(err.code(), codes::FRAMING_BAD_MAGIC);
    assert!(session.is_closed());
    assert_eq!(handler.errors().len(), 1);
    assert_eq!(handler.closes(), 1);
    assert!(decoded(&handler).is_empty());
}

#[test]
fn frames_written_by_the_handler_are_encoded() {
    let (session, _handler) = session_with_filter();
    let reply = FaiFrame::request(9, 8, 7, &b"pong"[..]);
    session.write(Message::user(reply.clone())).try_get().unwrap().unwrap();

    let mut wire = BytesMut::from(&session.take_wire()[..]);
    assert_eq!(FaiCodec::new(LIMIT).decode(&mut wire).unwrap(), Some(reply));
}
