//! Intake validation for batch submissions.
//!
//! Pure checks shared by the API surface; everything here runs before any
//! row is inserted or any byte leaves the process.

use std::path::Path;

/// Maximum length of the optional route label
pub const MAX_ROUTE_NAME_LENGTH: usize = 250;

/// Image extensions accepted for analysis
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "tif", "tiff", "bmp", "dng", "raw", "nef", "cr2", "arw",
];

/// Archives are rejected outright: images are submitted individually
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "tar"];

/// Validation error types
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NoFiles,
    TooManyFiles { max: usize },
    TotalSizeExceeded { max_bytes: u64 },
    ArchiveNotAllowed { file_name: String },
    UnsupportedExtension { file_name: String },
    RouteNameTooLong { max: usize },
    ConfidenceOutOfRange,
    PreviewLimitOutOfRange { max: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoFiles => write!(f, "no files submitted for analysis"),
            ValidationError::TooManyFiles { max } => {
                write!(f, "batch exceeds the maximum of {} files", max)
            }
            ValidationError::TotalSizeExceeded { max_bytes } => {
                write!(f, "combined file size exceeds {} bytes", max_bytes)
            }
            ValidationError::ArchiveNotAllowed { file_name } => {
                write!(
                    f,
                    "'{}': zip/tar archives are not supported, submit individual images",
                    file_name
                )
            }
            ValidationError::UnsupportedExtension { file_name } => {
                write!(
                    f,
                    "'{}': unsupported format, allowed extensions are {}",
                    file_name,
                    SUPPORTED_EXTENSIONS.join(", ")
                )
            }
            ValidationError::RouteNameTooLong { max } => {
                write!(f, "route_name exceeds maximum length of {} characters", max)
            }
            ValidationError::ConfidenceOutOfRange => {
                write!(f, "conf must be between 0.0 and 1.0")
            }
            ValidationError::PreviewLimitOutOfRange { max } => {
                write!(f, "preview_limit must be between 1 and {}", max)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Lowercased extension of a file name, if any
fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Validate a single submitted file name against the extension policy
pub fn validate_file_name(file_name: &str) -> Result<(), ValidationError> {
    let extension = extension_of(file_name);

    if let Some(ext) = &extension
        && ARCHIVE_EXTENSIONS.contains(&ext.as_str())
    {
        return Err(ValidationError::ArchiveNotAllowed {
            file_name: file_name.to_string(),
        });
    }

    match extension {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(ValidationError::UnsupportedExtension {
            file_name: file_name.to_string(),
        }),
    }
}

/// Validate the file count bounds of a batch
pub fn validate_file_count(count: usize, max_files: usize) -> Result<(), ValidationError> {
    if count == 0 {
        return Err(ValidationError::NoFiles);
    }
    if count > max_files {
        return Err(ValidationError::TooManyFiles { max: max_files });
    }
    Ok(())
}

/// Validate the combined byte size of a batch
pub fn validate_total_size(total_bytes: u64, max_bytes: u64) -> Result<(), ValidationError> {
    if total_bytes > max_bytes {
        return Err(ValidationError::TotalSizeExceeded { max_bytes });
    }
    Ok(())
}

/// Validate the optional route label
pub fn validate_route_name(route_name: &str) -> Result<(), ValidationError> {
    if route_name.chars().count() > MAX_ROUTE_NAME_LENGTH {
        return Err(ValidationError::RouteNameTooLong {
            max: MAX_ROUTE_NAME_LENGTH,
        });
    }
    Ok(())
}

/// Validate the confidence threshold, inclusive bounds
pub fn validate_confidence(conf: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&conf) || conf.is_nan() {
        return Err(ValidationError::ConfidenceOutOfRange);
    }
    Ok(())
}

/// Validate the requested preview count, `1..=max`
pub fn validate_preview_limit(preview_limit: i64, max: usize) -> Result<(), ValidationError> {
    if preview_limit < 1 || preview_limit > max as i64 {
        return Err(ValidationError::PreviewLimitOutOfRange { max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions_accepted() {
        for name in ["a.jpg", "b.JPEG", "c.png", "d.tiff", "e.NEF", "f.cr2"] {
            assert!(validate_file_name(name).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn test_archives_rejected() {
        assert_eq!(
            validate_file_name("batch.zip"),
            Err(ValidationError::ArchiveNotAllowed {
                file_name: "batch.zip".to_string()
            })
        );
        assert!(matches!(
            validate_file_name("batch.TAR"),
            Err(ValidationError::ArchiveNotAllowed { .. })
        ));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        assert!(matches!(
            validate_file_name("image.gif"),
            Err(ValidationError::UnsupportedExtension { .. })
        ));
        assert!(matches!(
            validate_file_name("no_extension"),
            Err(ValidationError::UnsupportedExtension { .. })
        ));
    }

    #[test]
    fn test_file_count_bounds() {
        assert_eq!(validate_file_count(0, 50_000), Err(ValidationError::NoFiles));
        assert!(validate_file_count(1, 50_000).is_ok());
        assert!(validate_file_count(50_000, 50_000).is_ok());
        assert_eq!(
            validate_file_count(50_001, 50_000),
            Err(ValidationError::TooManyFiles { max: 50_000 })
        );
    }

    #[test]
    fn test_total_size_boundary() {
        let max = 10u64 * 1024 * 1024 * 1024;
        assert!(validate_total_size(max, max).is_ok());
        assert_eq!(
            validate_total_size(max + 1, max),
            Err(ValidationError::TotalSizeExceeded { max_bytes: max })
        );
    }

    #[test]
    fn test_confidence_bounds_inclusive() {
        assert!(validate_confidence(0.0).is_ok());
        assert!(validate_confidence(1.0).is_ok());
        assert!(validate_confidence(0.35).is_ok());
        assert!(validate_confidence(-0.1).is_err());
        assert!(validate_confidence(1.1).is_err());
    }

    #[test]
    fn test_preview_limit_bounds() {
        assert!(validate_preview_limit(0, 10).is_err());
        assert!(validate_preview_limit(1, 10).is_ok());
        assert!(validate_preview_limit(10, 10).is_ok());
        assert!(validate_preview_limit(11, 10).is_err());
    }

    #[test]
    fn test_route_name_length() {
        assert!(validate_route_name(&"x".repeat(250)).is_ok());
        assert!(validate_route_name(&"x".repeat(251)).is_err());
    }
}
