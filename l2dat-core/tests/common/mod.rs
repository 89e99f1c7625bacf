#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use l2dat_core::crypto::memory::SessionMemory;
use l2dat_core::{CipherRegistry, DescriptorRegistry, Registries};

pub const DESCRIPTORS: &str = r#"
[[chronicle]]
name = "C4"
default_cipher = "111"

[[chronicle.descriptor]]
name = "itemname"
files = ["ItemName-e.dat"]
[[chronicle.descriptor.field]]
name = "id"
type = "u32"
[[chronicle.descriptor.field]]
name = "name"
type = "ascf"
[[chronicle.descriptor.field]]
name = "popup"
type = "i32"

[[chronicle]]
name = "Interlude"
extends = "C4"

[[chronicle.descriptor]]
name = "npcgrp"
files = ["*Grp.dat"]
[[chronicle.descriptor.field]]
name = "npc_id"
type = "u32"
[[chronicle.descriptor.field]]
name = "class_name"
type = "ascf"
[[chronicle.descriptor.field]]
name = "skills"
type = "list"
of = "u32"
count = "u8"
[[chronicle.descriptor.field]]
name = "collision"
type = "struct"
members = ["f32", "f32"]
[[chronicle.descriptor.field]]
name = "hash"
type = "hex"
size = 2
"#;

pub const CIPHERS: &str = r#"
[[cipher]]
name = "111"
header = "Lineage2Ver111"
kind = "xor"
key = 0xAC

[[cipher]]
name = "120"
header = "Lineage2Ver120"
kind = "xor_position"
seed = 0xE6

[[cipher]]
name = "121"
header = "Lineage2Ver121"
kind = "xor_filename"

[[cipher]]
name = "413"
header = "Lineage2Ver413"
kind = "sealed"
key = "5f2c1a9e0b7d43c6a18e92f4d07b3c5e6a1f8d2b9c4e07a3f5d6b8c1e2a49f07"
compress = true
"#;

pub fn registries() -> Registries {
    Registries::new(
        DescriptorRegistry::parse_str(DESCRIPTORS, "descriptors").expect("descriptors"),
        CipherRegistry::parse_str(CIPHERS, "ciphers").expect("ciphers"),
        Arc::new(SessionMemory::new()),
    )
}

/// NpcGrp text with `n` records.
pub fn npc_text(n: usize) -> String {
    (0..n)
        .map(|i| {
            format!(
                "npc_id={}\nclass_name=Gremlin\\s{i}\nskills=[4416 {}]\ncollision={{8.5 23}}\nhash=beef\n",
                20000 + i,
                4000 + i
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes an encrypted NpcGrp-shaped DAT with `n` records.
pub fn write_npc_dat(reg: &Registries, path: &Path, cipher: &str, n: usize) {
    let cipher = reg.ciphers.get_encrypt_key(cipher).expect("cipher");
    let descriptor = reg
        .descriptors
        .find_descriptor_for_file("Interlude", "NpcGrp.dat")
        .expect("descriptor");
    let codec = l2dat_core::DatCodec::new(&descriptor);
    let records = codec
        .parse_text(&npc_text(n), &mut l2dat_core::task::TaskContext::detached(), 100.0)
        .expect("fixture text parses");
    let payload = codec.encode(&records).expect("fixture encodes");
    let name = path.file_name().expect("file name").to_string_lossy();
    let raw = cipher.encrypt_file(&name, &payload).expect("encrypt");
    std::fs::write(path, raw).expect("write fixture");
}
