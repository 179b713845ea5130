//! Per-operation transfer descriptor.

use std::time::SystemTime;

/// Describes a single read, write or copy.
///
/// Built by the caller before the operation starts and only read by features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatus {
    /// Expected plaintext length, `None` when streaming an unknown size.
    pub length: Option<u64>,
    /// Plaintext offset to resume from.
    pub offset: u64,
    /// Append to the existing target instead of overwriting it.
    pub append: bool,
    /// Hint that the target already exists.
    pub exists: bool,
    /// Modification time to apply to the target, when supported.
    pub modified: Option<SystemTime>,
}

impl TransferStatus {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    #[must_use]
    pub fn exists(mut self, exists: bool) -> Self {
        self.exists = exists;
        self
    }

    #[must_use]
    pub fn modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Whether the operation resumes an earlier partial transfer.
    pub fn is_resume(&self) -> bool {
        self.append || self.offset > 0
    }

    /// Bytes still to transfer, when the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|length| length.saturating_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fresh_overwrite() {
        let status = TransferStatus::default();
        assert_eq!(status.length, None);
        assert_eq!(status.offset, 0);
        assert!(!status.is_resume());
        assert_eq!(status.remaining(), None);
    }

    #[test]
    fn test_builder_pattern() {
        let status = TransferStatus::new().length(100).offset(40).exists(true);
        assert!(status.is_resume());
        assert!(status.exists);
        assert_eq!(status.remaining(), Some(60));
    }
}
