//! IDA-style binary patterns with per-byte wildcards

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("pattern is invalid. pattern must be a-f, A-F, 0-9, or ?? or ? for wildcards")]
    Invalid,
    #[error("pattern must contain at least one byte")]
    Empty,
}

/// An IDA-style binary pattern
///
/// Each element is either a concrete byte or a wildcard which matches any
/// byte. Two patterns are equal iff they are equal elementwise.
#[derive(Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pattern(\"")?;

        let mut bytes = self.bytes.iter().peekable();
        while let Some(byte) = bytes.next() {
            match byte {
                Some(b) => write!(f, "{b:02X}")?,
                None => write!(f, "??")?,
            }

            if bytes.peek().is_some() {
                write!(f, " ")?;
            }
        }

        write!(f, "\")")
    }
}

impl Pattern {
    /// Create a new IDA-style [`Pattern`] instance
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// Pattern::new("48 89 ?? 24 ?? 48 89 6c");
    /// Pattern::new("48 89 ? 24 ? 48 89 6c");
    /// ```
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let char_to_byte = |c| match c {
            c if matches!(c, 'a'..='f') => c as u8 - b'a' + 0xA,
            c if matches!(c, 'A'..='F') => c as u8 - b'A' + 0xA,
            c if c.is_ascii_digit() => c as u8 - b'0',
            _ => unreachable!(),
        };

        let mut bytes = Vec::new();

        let mut pattern = pattern.chars().peekable();

        while let Some(sym) = pattern.next() {
            let next_sym = pattern.peek().copied();

            match sym {
                ' ' => (),

                '?' => {
                    bytes.push(None);

                    pattern.next_if_eq(&'?');
                }

                _ => {
                    // check if iterator got out of sync, which indicates a partial match
                    let Some(next_sym) = next_sym else {
                        return Err(PatternError::Invalid);
                    };

                    // only hex digits are allowed; a-f A-F 0-9
                    if !sym.is_ascii_hexdigit() || !next_sym.is_ascii_hexdigit() {
                        return Err(PatternError::Invalid);
                    }

                    let byte = char_to_byte(sym) << 4 | char_to_byte(next_sym);

                    bytes.push(Some(byte));

                    pattern.next();
                }
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The pattern's elements; `None` is a wildcard
    pub fn bytes(&self) -> &[Option<u8>] {
        &self.bytes
    }

    /// Strip the leading wildcards, returning how many were stripped and the
    /// remaining view. The view starts with a concrete byte, or is empty for
    /// an all-wildcard pattern.
    pub(crate) fn truncate(&self) -> (usize, &[Option<u8>]) {
        let offset = self.bytes.iter().take_while(|b| b.is_none()).count();
        (offset, &self.bytes[offset..])
    }
}

impl From<&[u8]> for Pattern {
    fn from(value: &[u8]) -> Self {
        Self {
            bytes: value.iter().copied().map(Some).collect(),
        }
    }
}

impl<const N: usize> From<[Option<u8>; N]> for Pattern {
    fn from(value: [Option<u8>; N]) -> Self {
        Self {
            bytes: value.to_vec(),
        }
    }
}

impl TryFrom<&str> for Pattern {
    type Error = PatternError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Builds a signature literal as a `[Option<u8>; N]`, usable in consts
///
/// # Example
///
/// ```rust,ignore
/// let pat = Pattern::from(sig![0x48, 0x8B, ?, ?, 0x90]);
/// ```
#[macro_export]
macro_rules! sig {
    (@elem ?) => { None };
    (@elem $b:literal) => { Some($b) };
    ($($t:tt),* $(,)?) => { [$($crate::sig!(@elem $t)),*] };
}
