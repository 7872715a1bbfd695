//! Feeds Bundle output straight into a FrameDecoder: what one end frames,
//! the other end must unframe, including messages that spill across
//! segment boundaries.

use kbe_shared::{
    Bundle, ByteStream, DecodeProgress, Frame, FrameDecoder, MessageCatalog, SegmentSink,
    SendError, ServerApp, STREAM_BUFFER_MAX,
};

// Echo-shaped client messages so the decoder's client table can route what
// the bundle writes back at it.
fn test_catalog() -> MessageCatalog {
    let mut blob = ByteStream::new();
    blob.write_u16(3);

    blob.write_u16(701);
    blob.write_i16(-1);
    blob.write_string("Client_echoVar");
    blob.write_i8(-1);
    blob.write_u8(0);

    blob.write_u16(702);
    blob.write_i16(16);
    blob.write_string("Client_echoFixed");
    blob.write_i8(0);
    blob.write_u8(2);
    blob.write_u8(14);
    blob.write_u8(14);

    blob.write_u16(703);
    blob.write_i16(0);
    blob.write_string("Client_echoEmpty");
    blob.write_i8(0);
    blob.write_u8(0);

    let mut catalog = MessageCatalog::new();
    catalog
        .import_from_stream(&mut blob, ServerApp::BaseApp)
        .unwrap();
    catalog
}

// Each sealed segment goes into the decoder as if it had just arrived off
// the socket.
struct DecodeSink<'a> {
    decoder: &'a mut FrameDecoder,
    catalog: &'a MessageCatalog,
    frames: &'a mut Vec<Frame>,
}

impl SegmentSink for DecodeSink<'_> {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        match self.decoder.process(data, self.catalog, self.frames) {
            DecodeProgress::Consumed => Ok(()),
            DecodeProgress::Stalled { .. } => Err(SendError),
        }
    }
}

#[test]
fn mixed_messages_round_trip() {
    let catalog = test_catalog();
    let var = catalog.get("Client_echoVar").unwrap().clone();
    let fixed = catalog.get("Client_echoFixed").unwrap().clone();
    let empty = catalog.get("Client_echoEmpty").unwrap().clone();

    let mut bundle = Bundle::new();
    bundle.start_message(&var);
    bundle.write_i32(-42);
    bundle.write_string("grail");
    bundle.write_blob(&[9, 9, 9]);
    bundle.start_message(&fixed);
    bundle.write_f64(1.5);
    bundle.write_f64(-2.25);
    bundle.start_message(&empty);

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    let sent = bundle.send(&mut DecodeSink {
        decoder: &mut decoder,
        catalog: &catalog,
        frames: &mut frames,
    });
    assert!(sent.is_ok());

    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].id, 701);
    assert_eq!(frames[0].body.read_i32().unwrap(), -42);
    assert_eq!(frames[0].body.read_string().unwrap(), "grail");
    assert_eq!(frames[0].body.read_blob().unwrap(), vec![9, 9, 9]);
    assert!(frames[0].body.remaining().is_empty());

    assert_eq!(frames[1].id, 702);
    assert_eq!(frames[1].body.read_f64().unwrap(), 1.5);
    assert_eq!(frames[1].body.read_f64().unwrap(), -2.25);
    assert!(frames[1].body.remaining().is_empty());

    assert_eq!(frames[2].id, 703);
    assert!(frames[2].body.remaining().is_empty());
}

#[test]
fn spilled_message_survives_the_wire() {
    let catalog = test_catalog();
    let var = catalog.get("Client_echoVar").unwrap().clone();

    // Larger than one segment, so the bundle seals mid-message and the
    // length patch lands in the first segment.
    let big = vec![0x5A_u8; STREAM_BUFFER_MAX + 1200];

    let mut bundle = Bundle::new();
    bundle.start_message(&var);
    bundle.write_blob(&big);

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    let sent = bundle.send(&mut DecodeSink {
        decoder: &mut decoder,
        catalog: &catalog,
        frames: &mut frames,
    });
    assert!(sent.is_ok());

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 701);
    assert_eq!(frames[0].body.read_blob().unwrap(), big);
    assert!(frames[0].body.remaining().is_empty());
}

#[test]
fn small_messages_around_a_spill_stay_ordered() {
    let catalog = test_catalog();
    let var = catalog.get("Client_echoVar").unwrap().clone();
    let empty = catalog.get("Client_echoEmpty").unwrap().clone();

    let big = vec![0x11_u8; STREAM_BUFFER_MAX * 2];

    let mut bundle = Bundle::new();
    bundle.start_message(&var);
    bundle.write_u8(1);
    bundle.start_message(&var);
    bundle.write_blob(&big);
    bundle.start_message(&empty);
    bundle.start_message(&var);
    bundle.write_u8(2);

    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();
    let sent = bundle.send(&mut DecodeSink {
        decoder: &mut decoder,
        catalog: &catalog,
        frames: &mut frames,
    });
    assert!(sent.is_ok());

    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].body.read_u8().unwrap(), 1);
    assert_eq!(frames[1].body.read_blob().unwrap(), big);
    assert_eq!(frames[2].id, 703);
    assert_eq!(frames[3].body.read_u8().unwrap(), 2);
}

#[test]
fn bundle_reuse_does_not_leak_between_sends() {
    let catalog = test_catalog();
    let var = catalog.get("Client_echoVar").unwrap().clone();

    let mut bundle = Bundle::new();
    let mut decoder = FrameDecoder::new();
    let mut frames: Vec<Frame> = Vec::new();

    bundle.start_message(&var);
    bundle.write_string("first");
    assert!(bundle
        .send(&mut DecodeSink {
            decoder: &mut decoder,
            catalog: &catalog,
            frames: &mut frames,
        })
        .is_ok());

    bundle.start_message(&var);
    bundle.write_string("second");
    assert!(bundle
        .send(&mut DecodeSink {
            decoder: &mut decoder,
            catalog: &catalog,
            frames: &mut frames,
        })
        .is_ok());

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].body.read_string().unwrap(), "first");
    assert_eq!(frames[1].body.read_string().unwrap(), "second");
}
