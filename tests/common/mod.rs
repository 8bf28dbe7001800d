#![allow(dead_code)]

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;

pub const PASSWORD: &str = "correct horse";
pub const IOS_SUBJECT: &str = "iPhone Distribution: Example Corp (ABCDE12345)";
pub const DEVICE: &str = "00008030001a2b3c4d5e6f70000000000000abcd";

pub const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>CFBundleExecutable</key>
	<string>Demo</string>
	<key>CFBundleIdentifier</key>
	<string>com.example.demo</string>
	<key>CFBundleName</key>
	<string>Demo</string>
	<key>CFBundleShortVersionString</key>
	<string>3.1</string>
</dict>
</plist>
"#;

const PROFILE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Name</key>
	<string>Demo Ad Hoc</string>
	<key>UUID</key>
	<string>5f1d3e2a-0000-4000-8000-000000000001</string>
	<key>Entitlements</key>
	<dict>
		<key>application-identifier</key>
		<string>ABCDE12345.com.example.demo</string>
		<key>get-task-allow</key>
		<false/>
	</dict>
	<key>ProvisionedDevices</key>
	<array>
		<string>1111111111111111111111111111111111111111</string>
	</array>
</dict>
</plist>
"#;

/// A test workspace: inputs live at the top, scratch directories go under `scratch/`.
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("scratch")).unwrap();
        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.path("scratch")
    }

    pub fn scratch_is_empty(&self) -> bool {
        fs::read_dir(self.scratch_root()).unwrap().next().is_none()
    }

    pub fn write_p12(&self, common_name: &str, password: &str) -> PathBuf {
        let path = self.path("cert.p12");
        fs::write(&path, p12_container(common_name, password)).unwrap();
        path
    }

    pub fn write_profile(&self) -> PathBuf {
        let path = self.path("demo.mobileprovision");
        let mut raw = b"\x30\x80\x06\x09\x2a\x86\x48\x86\xf7\x0d\x01\x07\x02\xa0\x80".to_vec();
        raw.extend_from_slice(PROFILE_PLIST.as_bytes());
        raw.extend_from_slice(b"\x00\x00\xa0\x82\x01\x00signature-blob");
        fs::write(&path, raw).unwrap();
        path
    }

    /// An archive with a Mach-O main executable and one framework dylib.
    pub fn write_ipa(&self) -> PathBuf {
        let path = self.path("demo.ipa");
        write_zip(
            &path,
            &[
                ("Payload/Demo.app/Info.plist", INFO_PLIST.as_bytes().to_vec()),
                ("Payload/Demo.app/Demo", macho(0x2, 64 * 1024, 1)),
                ("Payload/Demo.app/Frameworks/libA.dylib", macho(0x6, 16 * 1024, 2)),
                ("Payload/Demo.app/Assets.car", noise(8 * 1024, 3)),
                ("Payload/Demo.app/embedded.mobileprovision", b"old profile".to_vec()),
                ("iTunesMetadata.plist", b"<plist/>".to_vec()),
            ],
        );
        path
    }

    /// An archive whose only "executable" is a shell script.
    pub fn write_resource_only_ipa(&self) -> PathBuf {
        let path = self.path("scripts.ipa");
        write_zip(
            &path,
            &[
                ("Payload/Demo.app/Info.plist", INFO_PLIST.as_bytes().to_vec()),
                ("Payload/Demo.app/Demo", b"#!/bin/sh\necho not a binary\n".to_vec()),
                ("Payload/Demo.app/readme.txt", b"hello".to_vec()),
            ],
        );
        path
    }
}

pub fn p12_container(common_name: &str, password: &str) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).unwrap();

    p12::PFX::new(cert.der(), &key.serialize_der(), None, password, "signer")
        .unwrap()
        .to_der()
}

/// Little-endian 64-bit Mach-O header of `filetype` followed by noise.
pub fn macho(filetype: u32, len: usize, seed: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&0xfeedfacf_u32.to_le_bytes());
    data.extend_from_slice(&0x0100000c_u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&filetype.to_le_bytes());
    data.extend_from_slice(&[0u8; 16]);
    data.extend(noise(len.saturating_sub(data.len()), seed));
    data
}

/// Incompressible filler so archive sizes stay comparable after a rebuild.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
        let options = SimpleFileOptions::default().unix_permissions(0o755);
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

pub fn entry_names(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

pub fn read_entry(path: &Path, name: &str) -> Vec<u8> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = Vec::new();
    entry.read_to_end(&mut out).unwrap();
    out
}
