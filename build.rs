//! Build script for RSS Sentinel
//!
//! Embeds the Windows version info and an administrator manifest; adapter
//! and registry changes fail without elevation.

fn main() {
    // Windows-specific configuration
    #[cfg(windows)]
    {
        use std::path::Path;

        let res_path = Path::new("resources/windows/sentinel.rc");
        let manifest_path = Path::new("resources/windows/sentinel.manifest");

        if res_path.exists() && manifest_path.exists() {
            embed_resource::compile("resources/windows/sentinel.rc", embed_resource::NONE);
        } else {
            println!("cargo:warning=Windows resources missing, building without manifest");
        }
    }

    // Rerun if build.rs changes or resources change
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=resources/windows/sentinel.rc");
    println!("cargo:rerun-if-changed=resources/windows/sentinel.manifest");
}
