//! Logical file keys and how they map onto URLs.
//!
//! A logical key is either a bare storage key (`"abc"`) or a storage key and
//! a display filename joined by the first `|` (`"abc|report.pdf"`). The whole
//! logical key names one directory under the bucket; the filename only
//! influences what the client sees.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::FileUploadError;

pub const KEY_SEPARATOR: char = '|';

/// Everything except RFC 3986 unreserved characters gets escaped.
const URL_SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileKey {
    logical: String,
    separator_at: Option<usize>,
}

impl FileKey {
    pub fn parse(logical_key: &str) -> Result<Self, FileUploadError> {
        if logical_key.is_empty() {
            return Err(FileUploadError::invalid_key("empty file key"));
        }
        if logical_key.contains(['/', '\\', '\0']) {
            return Err(FileUploadError::invalid_key(format!(
                "file key must be a single path segment: {:?}",
                logical_key
            )));
        }
        if logical_key == "." || logical_key == ".." {
            return Err(FileUploadError::invalid_key(format!(
                "reserved file key: {:?}",
                logical_key
            )));
        }

        let separator_at = logical_key.find(KEY_SEPARATOR);
        if let Some(index) = separator_at {
            if index == 0 {
                return Err(FileUploadError::invalid_key(format!(
                    "missing storage key before '|': {:?}",
                    logical_key
                )));
            }
            if index + 1 == logical_key.len() {
                return Err(FileUploadError::invalid_key(format!(
                    "missing filename after '|': {:?}",
                    logical_key
                )));
            }
        }

        Ok(Self {
            logical: logical_key.to_string(),
            separator_at,
        })
    }

    /// The full key, filename included. Grants and physical paths use this.
    pub fn logical_key(&self) -> &str {
        &self.logical
    }

    pub fn storage_key(&self) -> &str {
        match self.separator_at {
            Some(index) => &self.logical[..index],
            None => &self.logical,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.separator_at
            .map(|index| &self.logical[index + KEY_SEPARATOR.len_utf8()..])
    }
}

/// Builds the externally visible URL for a file key.
#[derive(Debug, Clone)]
pub struct KeyAddressing {
    url_prefix: String,
}

impl KeyAddressing {
    pub fn new(url_prefix: impl Into<String>) -> Self {
        let url_prefix = url_prefix.into().trim_end_matches('/').to_string();
        Self { url_prefix }
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// `{prefix}/{storage_key}/` or `{prefix}/{storage_key}|{filename}/`.
    pub fn make_url(&self, key: &FileKey) -> String {
        let storage_key = encode_segment(key.storage_key());
        match key.filename() {
            Some(filename) => format!(
                "{}/{}{}{}/",
                self.url_prefix,
                storage_key,
                KEY_SEPARATOR,
                encode_segment(filename)
            ),
            None => format!("{}/{}/", self.url_prefix, storage_key),
        }
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, URL_SEGMENT_ENCODE_SET).to_string()
}
