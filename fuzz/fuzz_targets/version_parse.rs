#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Parsing must never panic; accepted versions must round-trip.
        if let Ok(version) = butler_semver::Version::parse(text) {
            let reparsed = butler_semver::Version::parse(version.render())
                .expect("rendered version must reparse");
            assert_eq!(version, reparsed);
        }
    }
});
