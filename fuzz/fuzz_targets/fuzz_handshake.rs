#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use relay_link::protocol::handshake::negotiate;

fuzz_target!(|data: &[u8]| {
    // Version negotiation on arbitrary relay replies
    let _ = negotiate(Bytes::copy_from_slice(data));
});
