//! Exposes the workspace `VERSION` file to the crate as `CAPWATCH_VERSION`.

use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
    let version_file = Path::new(&manifest_dir)
        .ancestors()
        .nth(2)
        .expect("app crate lives under <root>/crates/")
        .join("VERSION");

    println!("cargo:rerun-if-changed={}", version_file.display());

    let contents = fs::read_to_string(&version_file)
        .unwrap_or_else(|error| panic!("cannot read {}: {error}", version_file.display()));
    let version = contents.trim();
    let well_formed = !version.is_empty()
        && version.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+')
        });
    assert!(well_formed, "VERSION must look like 1.2.3, got {version:?}");

    println!("cargo:rustc-env=CAPWATCH_VERSION={version}");
}
