fn main() {
    println!("cargo:rerun-if-changed=proto/relay.proto");

    volo_build::Builder::protobuf()
        .add_service("proto/relay.proto")
        .include_dirs(vec![std::path::PathBuf::from(".")])
        .write()
        .unwrap();
}
