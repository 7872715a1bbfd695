//! End-to-end checks for the inbound frame decoder: however the transport
//! slices the byte stream, the decoder must deliver exactly the frames the
//! server wrote.

use kbe_shared::{ByteStream, DecodeProgress, Frame, FrameDecoder, MessageCatalog, ServerApp};
use proptest::prelude::*;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Registers three imported client messages next to the bootstrap set: a
// variable-length one, a fixed eight-byte one and a bodyless one.
fn test_catalog() -> MessageCatalog {
    let mut blob = ByteStream::new();
    blob.write_u16(3);

    blob.write_u16(601);
    blob.write_i16(-1);
    blob.write_string("Client_onChat");
    blob.write_i8(-1);
    blob.write_u8(0);

    blob.write_u16(602);
    blob.write_i16(8);
    blob.write_string("Client_onTwoCoords");
    blob.write_i8(0);
    blob.write_u8(2);
    blob.write_u8(13);
    blob.write_u8(13);

    blob.write_u16(603);
    blob.write_i16(0);
    blob.write_string("Client_onPing");
    blob.write_i8(0);
    blob.write_u8(0);

    let mut catalog = MessageCatalog::new();
    catalog
        .import_from_stream(&mut blob, ServerApp::BaseApp)
        .unwrap();
    catalog
}

fn wire_variable(id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_le_bytes());
    if body.len() >= u16::MAX as usize {
        out.extend_from_slice(&u16::MAX.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    }
    out.extend_from_slice(body);
    out
}

fn wire_fixed(id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(body);
    out
}

// A stream exercising every framing shape: variable, bodyless fixed, fixed,
// empty variable and the extended length escape.
fn mixed_stream() -> (Vec<u8>, Vec<(u16, Vec<u8>)>) {
    let expected = vec![
        (601, b"hello there".to_vec()),
        (603, Vec::new()),
        (602, vec![1, 2, 3, 4, 5, 6, 7, 8]),
        (521, Vec::new()),
        (601, vec![0xAB; 70_000]),
    ];
    let mut wire = Vec::new();
    for (id, body) in &expected {
        match *id {
            602 | 603 => wire.extend_from_slice(&wire_fixed(*id, body)),
            _ => wire.extend_from_slice(&wire_variable(*id, body)),
        }
    }
    (wire, expected)
}

fn assert_frames(frames: &[Frame], expected: &[(u16, Vec<u8>)]) {
    assert_eq!(frames.len(), expected.len());
    for (frame, (id, body)) in frames.iter().zip(expected) {
        assert_eq!(frame.id, *id);
        assert_eq!(frame.body.remaining(), &body[..]);
    }
}

#[test]
fn whole_buffer_delivers_every_frame() {
    let catalog = test_catalog();
    let (wire, expected) = mixed_stream();

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    assert_eq!(
        decoder.process(&wire, &catalog, &mut frames),
        DecodeProgress::Consumed
    );

    assert_frames(&frames, &expected);
}

#[test]
fn single_byte_chunks_deliver_every_frame() {
    let catalog = test_catalog();
    let (wire, expected) = mixed_stream();

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    for byte in &wire {
        decoder.process(std::slice::from_ref(byte), &catalog, &mut frames);
    }

    assert_frames(&frames, &expected);
}

#[test]
fn unknown_id_stalls_after_delivering_prior_frames() {
    init_logs();
    let catalog = test_catalog();
    let mut wire = wire_variable(601, b"ok");
    wire.extend_from_slice(&wire_variable(9999, b"nope"));

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    let progress = decoder.process(&wire, &catalog, &mut frames);

    // Everything up to and including the unknown id is consumed; the
    // caller keeps the rest for a retry once the catalog catches up.
    assert_eq!(
        progress,
        DecodeProgress::Stalled {
            id: 9999,
            used: wire.len() - 6,
        }
    );
    assert!(decoder.is_stalled());
    assert_frames(&frames, &[(601, b"ok".to_vec())]);
}

#[test]
fn empty_variable_frame_does_not_stall_the_stream() {
    let catalog = test_catalog();
    let mut wire = wire_variable(601, &[]);
    wire.extend_from_slice(&wire_variable(601, b"after"));

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    decoder.process(&wire, &catalog, &mut frames);

    assert_frames(
        &frames,
        &[(601, Vec::new()), (601, b"after".to_vec())],
    );
}

proptest! {
    /// Property: splitting the wire bytes at arbitrary points yields the
    /// same frames as one contiguous read.
    #[test]
    fn fragmentation_is_invisible(
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let catalog = test_catalog();
        let (wire, expected) = mixed_stream();

        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(wire.len())).collect();
        offsets.push(0);
        offsets.push(wire.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut decoder = FrameDecoder::new();
        let mut frames: Vec<Frame> = Vec::new();
        for pair in offsets.windows(2) {
            decoder.process(&wire[pair[0]..pair[1]], &catalog, &mut frames);
        }

        prop_assert_eq!(frames.len(), expected.len());
        for (frame, (id, body)) in frames.iter().zip(&expected) {
            prop_assert_eq!(frame.id, *id);
            prop_assert_eq!(frame.body.remaining(), &body[..]);
        }
    }

    /// Property: fixed-size chunked delivery matches as well.
    #[test]
    fn chunk_size_does_not_change_frames(chunk in 1usize..4096) {
        let catalog = test_catalog();
        let (wire, expected) = mixed_stream();

        let mut decoder = FrameDecoder::new();
        let mut frames: Vec<Frame> = Vec::new();
        for piece in wire.chunks(chunk) {
            decoder.process(piece, &catalog, &mut frames);
        }

        prop_assert_eq!(frames.len(), expected.len());
        for (frame, (id, body)) in frames.iter().zip(&expected) {
            prop_assert_eq!(frame.id, *id);
            prop_assert_eq!(frame.body.remaining(), &body[..]);
        }
    }
}
