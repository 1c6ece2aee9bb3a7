use std::env;

fn main() {
    let version = env::var("COINFER_VERSION_STRING")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "0.0.0".to_string());
    println!("cargo:rustc-env=COINFER_VERSION_STRING={version}");
    println!("cargo:rerun-if-env-changed=COINFER_VERSION_STRING");
}
