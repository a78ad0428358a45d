// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

fn main() {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");
    // Only the firmware image needs the cortex-m-rt link script.
    if std::env::var_os("CARGO_FEATURE_FIRMWARE").is_some() {
        println!(
            "cargo:rustc-link-arg-bins=-L{}",
            std::env::var("CARGO_MANIFEST_DIR").unwrap_or(".".to_string())
        );
        println!("cargo:rustc-link-arg-bins=-Tlink.x");
    }
}
