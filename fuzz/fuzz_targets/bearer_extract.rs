#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some(token) = butler_token::extract_bearer(data) {
        assert!(!token.is_empty());
        assert!(data.starts_with("Bearer "));
        // Classification is total over extracted tokens.
        let _ = butler_token::classify(token);
    }
});
