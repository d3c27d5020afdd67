#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use relay_link::core::codec::FrameCodec;
use relay_link::core::frame::Frame;
use relay_link::protocol::wire::{decode_frame, TimestampFormat};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Frame parsing must never panic, whole-buffer or streamed
    let _ = Frame::from_bytes(data);

    let mut codec = FrameCodec::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = decode_frame(frame.payload.clone(), TimestampFormat::Millis64, true);
        let _ = decode_frame(frame.payload, TimestampFormat::Seconds32, false);
    }
});
