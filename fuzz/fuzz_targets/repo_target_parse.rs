#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some((owner, repo)) = butler_registry::dispatch::parse_repo_target(data) {
        assert!(!owner.is_empty());
        assert!(!repo.is_empty());
        assert!(!repo.contains('/'));
    }
});
