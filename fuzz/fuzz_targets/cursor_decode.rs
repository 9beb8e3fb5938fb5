#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Decoding arbitrary input never panics; decoded cursors re-encode to
    // a decodable cursor.
    if let Some((value, id)) = butler_registry::cursor::decode_cursor(data) {
        let reencoded = butler_registry::cursor::encode_cursor(&value, id);
        assert_eq!(
            butler_registry::cursor::decode_cursor(&reencoded),
            Some((value, id))
        );
    }
});
