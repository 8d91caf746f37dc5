//! Metadata extraction.
//!
//! Reads the `warden.plugin` descriptor and the declared signature out of
//! a module's custom sections. Nothing is instantiated or executed: the
//! module is only walked with `wasmparser`.

use std::path::Path;

use serde::Deserialize;

use crate::contract::PluginMetadata;
use crate::error::PluginError;
use crate::package::{scan_sections, PluginImage, DEFAULT_MAX_IMAGE_SIZE};

/// Descriptor embedded in the `warden.plugin` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Descriptor {
    plugin: DescriptorMeta,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorMeta {
    name: String,
    version: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    api_version: String,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin name against `^[a-z][a-z0-9-]{1,63}$`.
///
/// The name must start with a lowercase ASCII letter, followed by 1-63
/// characters that are lowercase ASCII letters, digits, or hyphens.
/// Total length: 2-64 characters.
pub fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::MalformedMetadata(format!(
            "plugin name must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();

    // First character must be a lowercase ASCII letter
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::MalformedMetadata(format!(
                "plugin name must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(PluginError::MalformedMetadata(format!(
                "plugin name contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_length(value: &str, field_name: &str, max: usize) -> Result<(), PluginError> {
    let len = value.chars().count();
    if len > max {
        return Err(PluginError::MalformedMetadata(format!(
            "{field_name} must be at most {max} characters, got {len}"
        )));
    }
    Ok(())
}

impl DescriptorMeta {
    fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_name(&self.name)?;

        if self.version.trim().is_empty() {
            return Err(PluginError::MalformedMetadata(
                "plugin.version must not be empty".into(),
            ));
        }

        if let Some(ref description) = self.description {
            validate_length(description, "plugin.description", 500)?;
        }
        if let Some(ref author) = self.author {
            validate_length(author, "plugin.author", 255)?;
        }

        semver::VersionReq::parse(&self.api_version)?;

        for (i, dependency) in self.dependencies.iter().enumerate() {
            validate_plugin_name(dependency).map_err(|e| {
                PluginError::MalformedMetadata(format!("dependency '{dependency}': {e}"))
            })?;
            if dependency == &self.name {
                return Err(PluginError::MalformedMetadata(format!(
                    "plugin '{}' cannot depend on itself",
                    self.name
                )));
            }
            if self.dependencies[..i].contains(dependency) {
                return Err(PluginError::MalformedMetadata(format!(
                    "duplicate dependency '{dependency}'"
                )));
            }
        }

        Ok(())
    }

    fn into_metadata(self, signature: String) -> PluginMetadata {
        let mut metadata = PluginMetadata::new(self.name, self.version, self.api_version);
        metadata.author = self.author.unwrap_or_default();
        metadata.description = self.description.unwrap_or_default();
        metadata.dependencies = self.dependencies;
        metadata.signature = signature;
        metadata
    }
}

/// Parse and validate descriptor TOML.
///
/// The returned metadata carries no signature; that comes from the
/// module it is embedded in.
pub fn parse_descriptor(toml_str: &str) -> Result<PluginMetadata, PluginError> {
    let descriptor: Descriptor = toml::from_str(toml_str)
        .map_err(|e| PluginError::MalformedMetadata(format!("descriptor is not valid TOML: {e}")))?;
    descriptor.plugin.validate()?;
    Ok(descriptor.plugin.into_metadata(String::new()))
}

// ─── Extractor ──────────────────────────────────────────────────────

/// Reads plugin self-descriptions without activating them.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    max_image_size: u64,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_SIZE)
    }
}

impl MetadataExtractor {
    pub fn new(max_image_size: u64) -> Self {
        Self { max_image_size }
    }

    pub fn max_image_size(&self) -> u64 {
        self.max_image_size
    }

    /// Read a file and extract its metadata.
    pub fn extract(&self, path: &Path) -> Result<PluginMetadata, PluginError> {
        let image = PluginImage::read(path, self.max_image_size)
            .map_err(|e| PluginError::MetadataUnreadable(format!("{}: {e}", path.display())))?;
        self.extract_image(&image)
    }

    /// Extract metadata from an image that is already in memory.
    pub fn extract_image(&self, image: &PluginImage) -> Result<PluginMetadata, PluginError> {
        let sections = scan_sections(image.bytes()).map_err(|e| match e {
            PluginError::InvalidImage(reason) => {
                PluginError::MetadataUnreadable(format!("{}: {reason}", image.path().display()))
            }
            other => other,
        })?;

        let descriptor = sections.descriptor.ok_or_else(|| {
            PluginError::MetadataUnreadable(format!(
                "{}: no '{}' section",
                image.path().display(),
                crate::package::DESCRIPTOR_SECTION
            ))
        })?;

        let descriptor = std::str::from_utf8(descriptor).map_err(|_| {
            PluginError::MalformedMetadata("descriptor is not valid UTF-8".into())
        })?;

        let signature = match sections.signature {
            Some(raw) => std::str::from_utf8(raw)
                .map_err(|_| PluginError::MalformedMetadata("signature is not valid UTF-8".into()))?
                .trim()
                .to_ascii_lowercase(),
            None => String::new(),
        };

        let mut metadata = parse_descriptor(descriptor)?;
        metadata.signature = signature;

        tracing::trace!(
            plugin = %metadata.name,
            path = %image.path().display(),
            "metadata extracted"
        );

        Ok(metadata)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
