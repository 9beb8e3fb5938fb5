#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u16, u16, u16)| {
    let (expr, major, minor, patch) = data;
    // Constraint parsing is total: any input yields a matcher.
    let constraint = butler_semver::Constraint::parse(expr);
    let version =
        butler_semver::Version::parse(&format!("{major}.{minor}.{patch}")).expect("valid triple");
    // Matching must never panic either way.
    let _ = constraint.matches(&version);
});
