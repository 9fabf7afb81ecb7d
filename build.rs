fn main() {
    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let out = std::path::Path::new(&crate_dir).join("peer-identify.h");
    let mut cfg = cbindgen::Config::default();
    cfg.language = cbindgen::Language::C;
    cfg.include_guard = Some("PEER_IDENTIFY_H".to_string());
    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_config(cfg)
        .generate()
        .expect("cbindgen")
        .write_to_file(out);
}
