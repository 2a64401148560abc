fn main() {
    println!("cargo:rerun-if-env-changed=PGWARDEN_BUILD_VERSION");

    let version = std::env::var("PGWARDEN_BUILD_VERSION")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=PGWARDEN_BUILD_VERSION={version} ({target})");
}
