#![no_main]

use bytes::BytesMut;
use frame_session::core::codec::FrameCodec;
use frame_session::Frame;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Single-message decode must never panic or over-allocate
    let _ = Frame::from_bytes(data);

    // Stream decode: keep pulling frames until the codec wants more input
    let mut buf = BytesMut::from(data);
    let mut codec = FrameCodec;
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
