//! Inbound file validation
//!
//! The only inspection the relay does on file content: name shape,
//! extension allow-list, size ceiling and a sniff for binary signatures.
//! Analysis parameters from viewers are bounds-checked here as well.

use crate::config::{SessionLimits, ValidationConfig};
use crate::error::ValidationError;
use crate::protocol::{extension_of, MeasurementName};
use crate::types::AnalysisParams;

/// Leading bytes of formats that are never measurement text
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "Windows executable"),
    (b"\x7fELF", "ELF executable"),
    (b"PK\x03\x04", "zip archive"),
    (b"%PDF", "PDF document"),
    (b"#!", "script"),
    (b"\xfe\xed\xfa\xce", "Mach-O executable"),
    (b"\xfe\xed\xfa\xcf", "Mach-O executable"),
    (b"\xcf\xfa\xed\xfe", "Mach-O executable"),
    (b"\xca\xfe\xba\xbe", "Mach-O universal binary"),
    (b"\x1f\x8b", "gzip archive"),
];

/// How far into the content the NUL sniff looks
const SNIFF_LEN: usize = 8192;

/// Accepted file, with its parsed name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedFile {
    /// Frequency and index from the filename
    pub name: MeasurementName,
}

/// Validates files arriving from agents
#[derive(Debug, Clone)]
pub struct FileValidator {
    allowed: Vec<String>,
    max_bytes: usize,
}

impl FileValidator {
    /// Create from config; extensions are normalized to lowercase with a dot
    #[must_use]
    pub fn new(config: &ValidationConfig) -> Self {
        let allowed = config
            .allowed_extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_ascii_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect();
        Self {
            allowed,
            max_bytes: config.max_file_bytes,
        }
    }

    /// Check one file
    pub fn validate(&self, filename: &str, content: &str) -> Result<ValidatedFile, ValidationError> {
        if filename.trim().is_empty()
            || filename.contains(['/', '\\'])
            || filename.contains("..")
        {
            return Err(ValidationError::InvalidName(filename.to_string()));
        }

        let ext = extension_of(filename).unwrap_or_default();
        if !self.allowed.iter().any(|allowed| *allowed == ext) {
            return Err(ValidationError::DisallowedExtension(ext));
        }

        if content.len() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: content.len(),
                limit: self.max_bytes,
            });
        }

        sniff(content.as_bytes())?;

        let name = MeasurementName::parse(filename)
            .ok_or_else(|| ValidationError::UnrecognizedName(filename.to_string()))?;
        Ok(ValidatedFile { name })
    }
}

/// Check viewer-supplied parameters against the configured limits
pub fn check_params(limits: &SessionLimits, params: &AnalysisParams) -> Result<(), ValidationError> {
    let bound = |name: &'static str, value: u64, limit: u64| {
        if value > limit {
            Err(ValidationError::ParamOutOfRange { name, value, limit })
        } else {
            Ok(())
        }
    };
    bound("numFiles", params.num_files.into(), limits.max_num_files.into())?;
    bound(
        "frequencies",
        params.frequencies.len() as u64,
        limits.max_frequencies as u64,
    )?;
    if let Some(electrodes) = params.extra_f64("num_electrodes").filter(|v| *v >= 1.0) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let requested = electrodes.round() as u64;
        bound("num_electrodes", requested, limits.max_electrodes.into())?;
    }
    Ok(())
}

fn sniff(bytes: &[u8]) -> Result<(), ValidationError> {
    if let Some((_, what)) = SIGNATURES.iter().find(|(magic, _)| bytes.starts_with(magic)) {
        return Err(ValidationError::BinaryContent(*what));
    }
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    if head.contains(&0) {
        return Err(ValidationError::BinaryContent("NUL bytes"));
    }
    Ok(())
}
