use crate::{Error, Result};

/// A record label split into its logical-stream key and optional sequence suffix.
///
/// The wire format is `<key>.<decimal index>`. The suffix is only recognized when
/// everything after the last `.` is a non-empty run of ASCII digits, otherwise the
/// whole label is the key:
///
/// ```
/// use tarmux_core::FragmentLabel;
///
/// assert_eq!(FragmentLabel::parse("log.7").key(), "log");
/// assert_eq!(FragmentLabel::parse("file.tar.gz").key(), "file.tar.gz");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLabel<'a> {
    label: &'a str,
    key: &'a str,
    suffix: Option<&'a str>,
}

impl<'a> FragmentLabel<'a> {
    /// Split `label` into key and suffix, never fails.
    pub fn parse(label: &'a str) -> Self {
        if let Some((key, suffix)) = label.rsplit_once('.') {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                return Self {
                    label,
                    key,
                    suffix: Some(suffix),
                };
            }
        }

        Self {
            label,
            key: label,
            suffix: None,
        }
    }

    /// Shortcut for `FragmentLabel::parse(label).key()`.
    pub fn key_of(label: &'a str) -> &'a str {
        Self::parse(label).key
    }

    /// The full label as it was read from the record.
    pub fn label(&self) -> &'a str {
        self.label
    }

    /// The logical-stream key.
    pub fn key(&self) -> &'a str {
        self.key
    }

    /// Returns true if the label carries a numeric suffix.
    pub fn is_sequenced(&self) -> bool {
        self.suffix.is_some()
    }

    /// Parse the sequence index.
    ///
    /// Returns `Ok(None)` for labels without numeric suffix, or
    /// [`Error::MalformedIndex`] if the suffix does not fit in a `u64`.
    pub fn index(&self) -> Result<Option<u64>> {
        match self.suffix {
            Some(suffix) => suffix
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::MalformedIndex(self.label.to_owned())),
            None => Ok(None),
        }
    }
}

/// Attach a sequence index to a logical name, producing `name.index`.
pub fn format_label(name: &str, index: u64) -> String {
    format!("{}.{}", name, index)
}
