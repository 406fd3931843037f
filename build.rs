// build.rs
fn main() {
    // Build timestamp for `--version`
    vergen::EmitBuilder::builder()
        .all_build()
        .emit()
        .expect("Unable to generate build info");
}
