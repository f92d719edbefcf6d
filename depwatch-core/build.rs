fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Release images export the commit they were built from. Local builds
    // leave it unset and report the crate version alone.
    println!("cargo:rerun-if-env-changed=DEPWATCH_GIT_HASH");
    if let Ok(hash) = std::env::var("DEPWATCH_GIT_HASH") {
        println!("cargo:rustc-env=DEPWATCH_GIT_HASH={}", hash.trim());
    }
}
