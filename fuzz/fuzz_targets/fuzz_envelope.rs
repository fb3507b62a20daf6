#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_session::core::envelope::Envelope;
use peer_session::utils::buffer_pool::BufferPool;

fuzz_target!(|data: &[u8]| {
    // Inbound frames are attacker-controlled: decoding must never panic
    let pool = BufferPool::new(1);
    let _ = Envelope::from_buffer(pool.acquire_from(data), true);
    let _ = Envelope::from_buffer(pool.acquire_from(data), false);
});
