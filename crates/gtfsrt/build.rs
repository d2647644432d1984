use std::{env, fs, path::Path};

fn main() -> std::io::Result<()> {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let bindings_dir = Path::new(&out_dir).join("gtfsrt");
    fs::create_dir_all(&bindings_dir)?;

    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }

    prost_build::Config::new()
        .out_dir(&bindings_dir)
        .compile_protos(&["protobuf/gtfs-realtime.proto"], &["protobuf"])?;

    println!("cargo:rerun-if-changed=protobuf/gtfs-realtime.proto");
    Ok(())
}
