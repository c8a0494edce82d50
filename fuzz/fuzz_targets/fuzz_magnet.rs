#![no_main]
use libfuzzer_sys::fuzz_target;
use rangefetch::torrent::MagnetUri;

fuzz_target!(|data: &str| {
    // A parsed magnet must survive a round trip through its URI form
    if let Ok(magnet) = MagnetUri::parse(data) {
        let again = MagnetUri::parse(&magnet.to_uri()).expect("generated magnet must parse");
        assert_eq!(again.info_hash, magnet.info_hash);
    }
});
