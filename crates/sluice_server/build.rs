//! Generates the gRPC service bindings from the protobuf definition.

fn main() {
    std::env::set_var("PROTOC", protobuf_src::protoc());
    println!("cargo:rerun-if-changed=proto/sluice.proto");
    tonic_build::compile_protos("proto/sluice.proto").expect("compile sluice.proto");
}
