#![no_main]
use libfuzzer_sys::fuzz_target;
use rangefetch::http::range::parse_content_range;

fuzz_target!(|data: &str| {
    if let Some((start, end, total)) = parse_content_range(data) {
        assert!(start <= end);
        if let Some(total) = total {
            assert!(end < total);
        }
    }
});
