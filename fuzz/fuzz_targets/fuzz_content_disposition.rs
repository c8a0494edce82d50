#![no_main]
use libfuzzer_sys::fuzz_target;
use rangefetch::http::probe::{parse_content_disposition, sanitize_filename};

fuzz_target!(|data: &str| {
    // Whatever the header says, the sanitized name stays a plain file name
    if let Some(name) = parse_content_disposition(data).as_deref().and_then(sanitize_filename) {
        assert!(!name.contains('/') && !name.contains('\\'));
        assert!(name != "." && name != "..");
    }
});
