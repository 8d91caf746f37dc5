//! Plugin package layout.
//!
//! A plugin is a WASM module carrying two custom sections next to its
//! code:
//!
//! - `warden.plugin` - the TOML descriptor read by the metadata extractor.
//! - `warden.signature` - the lowercase hex SHA-256 of every byte that
//!   precedes this section. It must be the last section of the module, so
//!   the descriptor is covered by the digest.
//!
//! This module owns the section scan shared by the extractor, verifier
//! and loader, plus the authoring helpers that embed a descriptor and
//! seal a module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::PluginError;

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
pub const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Magic plus the 4-byte version field.
const WASM_HEADER_LEN: usize = 8;

/// Custom section holding the TOML descriptor.
pub const DESCRIPTOR_SECTION: &str = "warden.plugin";

/// Custom section holding the signature digest.
pub const SIGNATURE_SECTION: &str = "warden.signature";

/// Required export that constructs the plugin instance.
pub const CONSTRUCT_SYMBOL: &str = "warden_construct";

/// Required export that destroys the plugin instance.
pub const DESTROY_SYMBOL: &str = "warden_destroy";

/// Optional lifecycle exports.
pub const INITIALIZE_EXPORT: &str = "warden_initialize";
pub const SHUTDOWN_EXPORT: &str = "warden_shutdown";

/// Operations are exported as `op_<operation>`.
pub const OPERATION_PREFIX: &str = "op_";

/// Default max image size: 50 MB.
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 50 * 1024 * 1024;

// ─── Image ──────────────────────────────────────────────────────────────

/// A plugin binary read into memory.
///
/// The registry reads a file exactly once per load and hands the same
/// bytes to the extractor, the verifier and the loader, so the file cannot
/// be swapped between verification and mapping.
#[derive(Debug, Clone)]
pub struct PluginImage {
    path: PathBuf,
    bytes: Arc<[u8]>,
}

impl PluginImage {
    /// Read an image from disk, refusing files above `max_size` bytes.
    pub fn read(path: &Path, max_size: u64) -> Result<Self, PluginError> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PluginError::NotFound(path.display().to_string()),
            _ => PluginError::Io(e),
        })?;

        if !metadata.is_file() {
            return Err(PluginError::NotFound(path.display().to_string()));
        }

        let size = metadata.len();
        if size > max_size {
            return Err(PluginError::InvalidImage(format!(
                "image too large: {size} bytes (max: {max_size} bytes)"
            )));
        }

        let bytes = std::fs::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            bytes: bytes.into(),
        })
    }

    /// Wrap bytes that are already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

// ─── Section scan ───────────────────────────────────────────────────────

/// The package-relevant parts of a module.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSections<'a> {
    pub descriptor: Option<&'a [u8]>,
    pub signature: Option<&'a [u8]>,
    /// Length of the signed region: everything before the signature
    /// section, or the whole module when unsigned.
    pub signed_len: usize,
}

/// Number of bytes in the unsigned LEB128 encoding of `value`.
fn leb128_len(mut value: usize) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Scan a module's sections without executing or instantiating it.
///
/// Fails with `InvalidImage` when the bytes are not a parseable WASM
/// module, and with `MalformedMetadata` when the package sections are
/// duplicated or the signature section is not last.
pub fn scan_sections(bytes: &[u8]) -> Result<ModuleSections<'_>, PluginError> {
    use wasmparser::{Parser, Payload};

    if bytes.len() < WASM_MAGIC.len() || &bytes[..WASM_MAGIC.len()] != WASM_MAGIC {
        return Err(PluginError::InvalidImage(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    let mut sections = ModuleSections {
        descriptor: None,
        signature: None,
        signed_len: bytes.len(),
    };

    for payload in Parser::new(0).parse_all(bytes) {
        let payload =
            payload.map_err(|e| PluginError::InvalidImage(format!("failed to parse WASM: {e}")))?;

        if sections.signature.is_some() && !matches!(payload, Payload::End(_)) {
            return Err(PluginError::MalformedMetadata(format!(
                "'{SIGNATURE_SECTION}' must be the last section of the module"
            )));
        }

        if let Payload::CustomSection(reader) = payload {
            match reader.name() {
                DESCRIPTOR_SECTION => {
                    if sections.descriptor.is_some() {
                        return Err(PluginError::MalformedMetadata(format!(
                            "duplicate '{DESCRIPTOR_SECTION}' section"
                        )));
                    }
                    sections.descriptor = Some(reader.data());
                }
                SIGNATURE_SECTION => {
                    // `range()` covers the section contents; the id byte
                    // and the LEB128 size precede it.
                    let contents = reader.range();
                    let header = 1 + leb128_len(contents.len());
                    sections.signed_len = contents.start.checked_sub(header).ok_or_else(|| {
                        PluginError::InvalidImage("signature section offset underflow".into())
                    })?;
                    sections.signature = Some(reader.data());
                }
                _ => {}
            }
        }
    }

    Ok(sections)
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Digest of a module's signed region.
pub fn signed_digest(bytes: &[u8]) -> Result<String, PluginError> {
    let sections = scan_sections(bytes)?;
    Ok(sha256_hex(&bytes[..sections.signed_len]))
}

// ─── Authoring ──────────────────────────────────────────────────────────

/// A sealed module and the digest written into its signature section.
#[derive(Debug, Clone)]
pub struct SealedModule {
    pub bytes: Vec<u8>,
    pub digest: String,
}

fn append_custom_section(module: &[u8], name: &str, data: &[u8]) -> Vec<u8> {
    let mut encoder = wasm_encoder::Module::new();
    encoder.section(&wasm_encoder::CustomSection {
        name: name.into(),
        data: data.into(),
    });
    let encoded = encoder.finish();

    let mut out = Vec::with_capacity(module.len() + encoded.len());
    out.extend_from_slice(module);
    out.extend_from_slice(&encoded[WASM_HEADER_LEN..]);
    out
}

/// Embed a TOML descriptor into an unsealed module.
pub fn embed_descriptor(module: &[u8], descriptor_toml: &str) -> Result<Vec<u8>, PluginError> {
    let sections = scan_sections(module)?;
    if sections.signature.is_some() {
        return Err(PluginError::MalformedMetadata(
            "module is already sealed; embed the descriptor before sealing".into(),
        ));
    }
    if sections.descriptor.is_some() {
        return Err(PluginError::MalformedMetadata(format!(
            "module already has a '{DESCRIPTOR_SECTION}' section"
        )));
    }
    Ok(append_custom_section(
        module,
        DESCRIPTOR_SECTION,
        descriptor_toml.as_bytes(),
    ))
}

/// Seal a module by appending its signature section.
pub fn seal(module: &[u8]) -> Result<SealedModule, PluginError> {
    let sections = scan_sections(module)?;
    if sections.signature.is_some() {
        return Err(PluginError::MalformedMetadata(
            "module is already sealed".into(),
        ));
    }
    let digest = sha256_hex(module);
    let bytes = append_custom_section(module, SIGNATURE_SECTION, digest.as_bytes());
    Ok(SealedModule { bytes, digest })
}

// ─── Tests ──────────────────────────────────────────────────────────────
