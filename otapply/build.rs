// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

fn main() {
    println!("cargo:rerun-if-changed=protobuf/update_metadata.proto");

    let file_descriptors = protox::compile(["protobuf/update_metadata.proto"], ["protobuf"])
        .expect("Failed to compile protobuf definitions");

    prost_build::compile_fds(file_descriptors).expect("Failed to generate protobuf code");
}
