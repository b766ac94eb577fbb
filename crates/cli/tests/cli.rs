//! End-to-end CLI checks against the built binary.

use std::io::Write;
use std::process::Command;

/// Hand-encoded image: `Push 7; Return` under a variadic top level, so
/// the process exit code is 7.
fn exit7_image() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x1b, b's', b'u', b'c', 0, 1]);
    buf.extend_from_slice(&0u16.to_le_bytes());

    buf.extend_from_slice(&2u32.to_le_bytes()); // two instructions
    buf.extend_from_slice(&[0, 0]); // Push a=0
    buf.extend_from_slice(&0i16.to_le_bytes());
    buf.extend_from_slice(&[21, 0]); // Return
    buf.extend_from_slice(&0i16.to_le_bytes());

    buf.extend_from_slice(&1u32.to_le_bytes()); // one constant
    buf.push(3); // Number
    buf.extend_from_slice(&7.0f64.to_le_bytes());

    buf.extend_from_slice(&0u32.to_le_bytes()); // upvalues
    buf.extend_from_slice(&0u32.to_le_bytes()); // nested protos

    buf.extend_from_slice(&4u32.to_le_bytes());
    buf.extend_from_slice(b"main");

    buf.extend_from_slice(&2u32.to_le_bytes()); // line info
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf
}

#[test]
fn runs_image_and_propagates_exit_code() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&exit7_image()).unwrap();
    f.flush().unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_lyra"))
        .arg(f.path())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
fn rejects_source_text() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"(+ 1 2)").unwrap();
    f.flush().unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_lyra"))
        .arg(f.path())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("not a compiled image"));
}

#[test]
fn rejects_corrupt_image() {
    let mut image = exit7_image();
    image[4] = 9; // wrong major version
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&image).unwrap();
    f.flush().unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_lyra"))
        .arg(f.path())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Could not load"));
}
