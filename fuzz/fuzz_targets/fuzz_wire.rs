#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_channel::core::validate::RaceTolerant;
use secure_channel::core::wire::FrameReader;

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };

    rt.block_on(async {
        // Arbitrary bytes must never panic the framed reader
        let mut reader = FrameReader::with_max_string_len(data, 4096);
        let handler = RaceTolerant::new().allow(1, 2);
        while !reader.get_mut().is_empty() {
            let step = reader.read_byte().await;
            let result = match step {
                Ok(0) => reader.read_int().await.map(drop),
                Ok(1) => reader.read_long().await.map(drop),
                Ok(2) => reader.read_string().await.map(drop),
                Ok(3) => reader.read_int_either(1, 3, &handler).await.map(drop),
                Ok(_) => reader.read_byte_expect(7, &handler).await.map(drop),
                Err(e) => Err(e),
            };
            if result.is_err() {
                break;
            }
        }
    });
});
