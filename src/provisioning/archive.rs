//! Credential archive packaging
//!
//! The device-side bootstrap unpacks a zip with exactly three entries and
//! runs the script, which installs the certificate and key.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};
use zeroize::Zeroizing;

use crate::Error;

/// Archive entry holding the issued certificate
pub const CERT_ENTRY: &str = "cert.pem";
/// Archive entry holding the private key
pub const KEY_ENTRY: &str = "key.pem";
/// Archive entry holding the bootstrap script
pub const SCRIPT_ENTRY: &str = "autorun.sh";

/// Zip archive bytes, wiped on drop since they contain a private key
pub type CredentialArchive = Zeroizing<Vec<u8>>;

/// Package certificate, key and script into a zip archive
pub fn build_archive(
    certificate_pem: &str,
    private_key_pem: &str,
    script: &[u8],
) -> Result<CredentialArchive, Error> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = |mode: u32| {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode)
    };

    let entries: [(&str, &[u8], u32); 3] = [
        (CERT_ENTRY, certificate_pem.as_bytes(), 0o600),
        (KEY_ENTRY, private_key_pem.as_bytes(), 0o600),
        (SCRIPT_ENTRY, script, 0o755),
    ];

    for (name, contents, mode) in entries {
        writer
            .start_file(name, options(mode))
            .map_err(|e| Error::serialization(format!("failed to add {name} to archive: {e}")))?;
        writer
            .write_all(contents)
            .map_err(|e| Error::serialization(format!("failed to write {name}: {e}")))?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| Error::serialization(format!("failed to finish archive: {e}")))?;
    Ok(Zeroizing::new(cursor.into_inner()))
}
