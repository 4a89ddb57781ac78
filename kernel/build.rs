use std::path::PathBuf;

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    println!("cargo:rustc-link-arg=-T{}", manifest_dir.join("linker.ld").display());
    println!("cargo:rerun-if-changed=linker.ld");
}
