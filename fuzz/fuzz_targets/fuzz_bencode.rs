#![no_main]
use libfuzzer_sys::fuzz_target;
use rangefetch::torrent::BencodeValue;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode or error, never panic
    if let Ok(value) = BencodeValue::parse(data) {
        let _ = value.as_dict();
    }
});
