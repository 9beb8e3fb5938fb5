#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u8, &[u8])| {
    let (provider_index, body) = data;
    let provider = match provider_index % 4 {
        0 => "github",
        1 => "gitlab",
        2 => "bitbucket",
        _ => "unknown",
    };
    if let Some(event) = butler_webhook::parse_push(provider, body) {
        // A parsed tag always reconstructs its ref.
        if let Some(tag) = &event.tag {
            assert_eq!(event.ref_name, format!("refs/tags/{tag}"));
        }
    }
});
