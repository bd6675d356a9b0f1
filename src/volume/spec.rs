//! Parser for `path,option:value,…` volume specification strings.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const SUPPORTED_PAGE_SIZES: [u32; 5] = [1024, 2048, 4096, 8192, 16384];

/// A fully-resolved description of how to open or create a volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpecification {
    /// Path to the volume file on disk.
    pub path: PathBuf,
    /// Logical name; defaults to the file basename with a trailing `.vNN` stripped.
    pub name: String,
    /// Page size in bytes; must be one of the five supported sizes.
    pub page_size: u32,
    /// Initial page count reserved at creation.
    pub initial_pages: u64,
    /// Maximum page count the volume may grow to.
    pub maximum_pages: u64,
    /// Page count added per on-demand extension.
    pub extension_pages: u64,
    /// Create the file if it does not already exist.
    pub create: bool,
    /// Fail if the file already exists.
    pub create_only: bool,
    /// Open for reads only.
    pub read_only: bool,
    /// Delete the file when the volume is closed.
    pub temporary: bool,
}

impl VolumeSpecification {
    /// Parses a specification string of the form
    /// `path,pageSize:8192,initialSize:1m,maximumSize:64m,create`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(',');
        let path = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidVolumeSpec("missing path".into()))?;
        let path = PathBuf::from(path);

        let mut name = default_name(&path);
        let mut page_size: u32 = 16384;
        let mut initial_bytes: u64 = 1 << 20;
        let mut maximum_bytes: u64 = 0;
        let mut extension_bytes: u64 = 1 << 20;
        let mut create = false;
        let mut create_only = false;
        let mut read_only = false;
        let mut temporary = false;

        for token in parts {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once(':') {
                Some((key, value)) => match key {
                    "name" => name = value.to_string(),
                    "pageSize" => {
                        page_size = value
                            .parse()
                            .map_err(|_| invalid(format!("bad pageSize '{value}'")))?;
                    }
                    "initialSize" => initial_bytes = parse_byte_size(value)?,
                    "maximumSize" => maximum_bytes = parse_byte_size(value)?,
                    "extensionSize" => extension_bytes = parse_byte_size(value)?,
                    other => return Err(invalid(format!("unknown option '{other}'"))),
                },
                None => match token {
                    "create" => create = true,
                    "createOnly" => create_only = true,
                    "readOnly" => read_only = true,
                    "temporary" => temporary = true,
                    other => return Err(invalid(format!("unknown option '{other}'"))),
                },
            }
        }

        if !SUPPORTED_PAGE_SIZES.contains(&page_size) {
            return Err(invalid(format!("unsupported pageSize {page_size}")));
        }
        if maximum_bytes == 0 {
            maximum_bytes = initial_bytes.max(extension_bytes) * 1024;
        }

        let initial_pages = initial_bytes / page_size as u64;
        let maximum_pages = maximum_bytes / page_size as u64;
        let extension_pages = (extension_bytes / page_size as u64).max(1);

        if initial_pages == 0 || maximum_pages < initial_pages {
            return Err(invalid("maximumSize must be >= initialSize".into()));
        }
        if create_only && read_only {
            return Err(invalid("createOnly and readOnly are mutually exclusive".into()));
        }

        Ok(Self {
            path,
            name,
            page_size,
            initial_pages,
            maximum_pages,
            extension_pages,
            create,
            create_only,
            read_only,
            temporary,
        })
    }
}

fn invalid(msg: String) -> Error {
    Error::InvalidVolumeSpec(msg)
}

fn default_name(path: &Path) -> String {
    let stem = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("volume");
    match stem.rsplit_once(".v") {
        Some((base, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            base.to_string()
        }
        _ => stem.to_string(),
    }
}

/// Parses sizes like `1024`, `64k`, `16m`, `2g` into a byte count.
fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid("empty size".into()));
    }
    let (digits, multiplier) = match value.chars().last().unwrap().to_ascii_lowercase() {
        'k' => (&value[..value.len() - 1], 1024u64),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| invalid(format!("bad size '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let spec =
            VolumeSpecification::parse("data/vtest.v01,name:vtest,pageSize:16384,initialSize:1m,maximumSize:64m,create")
                .unwrap();
        assert_eq!(spec.name, "vtest");
        assert_eq!(spec.page_size, 16384);
        assert_eq!(spec.initial_pages, (1 << 20) / 16384);
        assert_eq!(spec.maximum_pages, (64 << 20) / 16384);
        assert!(spec.create);
    }

    #[test]
    fn default_name_strips_version_suffix() {
        let spec = VolumeSpecification::parse("data/accounts.v03").unwrap();
        assert_eq!(spec.name, "accounts");
    }

    #[test]
    fn rejects_unsupported_page_size() {
        assert!(VolumeSpecification::parse("x,pageSize:3000").is_err());
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(VolumeSpecification::parse("x,bogus:1").is_err());
    }

    #[test]
    fn rejects_empty_path() {
        assert!(VolumeSpecification::parse(",pageSize:4096").is_err());
    }
}
