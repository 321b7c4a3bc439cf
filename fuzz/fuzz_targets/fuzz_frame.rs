#![no_main]

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;
use nex_network::core::codec::recv_any;
use nex_network::FrameCodec;

fuzz_target!(|data: &[u8]| {
    // Frame decoding from buffers, datagrams and streams must never panic
    let codec = FrameCodec::with_max_payload(64 * 1024);
    let _ = codec.from_bytes(data);
    let _ = codec.decode_datagram(data);
    let _ = recv_any(&mut Cursor::new(data), 64 * 1024);
});
