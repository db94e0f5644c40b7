//! Build script for drnat
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `drnat --version`.

fn main() {
    // Re-run build if the packager overrides the default config location
    println!("cargo:rerun-if-env-changed=DRNAT_SYSTEM_CONFIG_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
