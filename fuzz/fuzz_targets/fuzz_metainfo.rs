#![no_main]
use libfuzzer_sys::fuzz_target;
use rangefetch::torrent::Metainfo;

fuzz_target!(|data: &[u8]| {
    // parse() should never panic on arbitrary input, nor should planning from it
    if let Ok(metainfo) = Metainfo::parse(data) {
        let _ = metainfo.transfer_request();
        let _ = metainfo.piece_range(metainfo.info.num_pieces().saturating_sub(1));
    }
});
