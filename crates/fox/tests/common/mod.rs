//! Fixtures shared by the pipeline tests: fake signed profiles, IPAs and a
//! signer that records what it was asked to do.

#![allow(dead_code)]

use fox::{CodeSigner, Error, SigningRequest};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const TEAM: &str = "TEAMID";

/// Bytes standing in for the CMS envelope around a profile payload.
const ENVELOPE_HEAD: &[u8] = b"0\x80\x06\t*\x86H\x86\xf7\r\x01\x07\x02\xa0\x800\x80\x02\x01\x01";
const ENVELOPE_TAIL: &[u8] = b"\x00\x00\xa0\x82\x0e<signature/>\x00\x00";

pub fn info_plist(identifier: &str, executable: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>{executable}</string>
    <key>CFBundleIdentifier</key>
    <string>{identifier}</string>
    <key>CFBundleShortVersionString</key>
    <string>2.0</string>
    <key>CFBundleVersion</key>
    <string>7</string>
</dict>
</plist>"#
    )
}

/// Write a fake signed provisioning profile and return its path.
pub fn write_profile(dir: &Path, file_name: &str, name: &str, uuid: &str, app_id: &str) -> PathBuf {
    let payload = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>{app_id}</string>
        <key>com.apple.developer.team-identifier</key>
        <string>{TEAM}</string>
        <key>keychain-access-groups</key>
        <array><string>{TEAM}.*</string></array>
    </dict>
    <key>Name</key>
    <string>{name}</string>
    <key>TeamIdentifier</key>
    <array><string>{TEAM}</string></array>
    <key>UUID</key>
    <string>{uuid}</string>
</dict>
</plist>"#
    );

    fs::create_dir_all(dir).unwrap();
    let mut data = ENVELOPE_HEAD.to_vec();
    data.extend_from_slice(payload.as_bytes());
    data.extend_from_slice(ENVELOPE_TAIL);
    let path = dir.join(file_name);
    fs::write(&path, data).unwrap();
    path
}

/// Write an IPA holding one signed bundle per name in `apps`.
pub fn write_ipa(path: &Path, apps: &[&str]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default();

    zip.add_directory("Payload/", options).unwrap();
    for app in apps {
        let root = format!("Payload/{app}.app");
        zip.add_directory(format!("{root}/"), options).unwrap();
        zip.add_directory(format!("{root}/_CodeSignature/"), options).unwrap();

        zip.start_file(format!("{root}/Info.plist"), options).unwrap();
        zip.write_all(info_plist("com.example.old", app).as_bytes()).unwrap();
        zip.start_file(format!("{root}/{app}"), options).unwrap();
        zip.write_all(b"MACHO_PLACEHOLDER").unwrap();
        zip.start_file(format!("{root}/embedded.mobileprovision"), options)
            .unwrap();
        zip.write_all(b"EXPIRED PROFILE").unwrap();
        zip.start_file(format!("{root}/_CodeSignature/CodeResources"), options)
            .unwrap();
        zip.write_all(b"<plist/>").unwrap();
    }
    zip.finish().unwrap();
}

/// What the signer saw when it was called.
#[derive(Debug, Clone)]
pub struct SignCall {
    pub request: SigningRequest,
    pub embedded_profile: Vec<u8>,
    pub entitlements: Vec<u8>,
    pub had_signature: bool,
}

/// A [`CodeSigner`] that records every request instead of signing.
#[derive(Clone, Default)]
pub struct RecordingSigner {
    calls: Arc<Mutex<Vec<SignCall>>>,
    fail: bool,
}

impl RecordingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signer that records the call and then fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SignCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl CodeSigner for RecordingSigner {
    fn sign(&self, request: &SigningRequest) -> fox::Result<String> {
        let bundle = &request.bundle_path;
        let call = SignCall {
            request: request.clone(),
            embedded_profile: fs::read(bundle.join("embedded.mobileprovision"))?,
            entitlements: fs::read(&request.entitlements_path)?,
            had_signature: bundle.join("_CodeSignature").exists(),
        };
        self.calls.lock().unwrap().push(call);

        if self.fail {
            return Err(Error::Io(io::Error::other("codesign: no identity found")));
        }
        Ok(format!("{}: replacing existing signature\n", bundle.display()))
    }
}
