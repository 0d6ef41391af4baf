//! Reversible, salted channel hash-ids.
//!
//! Channels are addressed in URLs by an opaque handle rather than their raw
//! integer id. The handle is a salted hashids encoding with a minimum
//! length, so handles are non-enumerable without the salt, constant-looking,
//! and decode back to exactly the id they were produced from.

use harsh::Harsh;

/// Minimum length of an encoded channel handle.
pub const DEFAULT_MIN_LENGTH: usize = 16;

/// Encoder/decoder for channel handles.
///
/// One codec instance is shared process-wide; the salt is injected by the
/// application (it is part of the deployment's identity, not of this crate).
#[derive(Clone)]
pub struct ChannelHash {
    harsh: Harsh,
}

impl std::fmt::Debug for ChannelHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The salt must not leak through debug output.
        f.debug_struct("ChannelHash").finish_non_exhaustive()
    }
}

impl ChannelHash {
    /// Builds a codec with the given salt and [`DEFAULT_MIN_LENGTH`].
    ///
    /// # Errors
    ///
    /// Returns [`HashIdError::Config`] if the underlying encoder rejects the
    /// configuration.
    pub fn new(salt: &str) -> Result<Self, HashIdError> {
        Self::with_min_length(salt, DEFAULT_MIN_LENGTH)
    }

    /// Builds a codec with an explicit minimum handle length.
    ///
    /// # Errors
    ///
    /// Returns [`HashIdError::Config`] if the underlying encoder rejects the
    /// configuration.
    pub fn with_min_length(salt: &str, min_length: usize) -> Result<Self, HashIdError> {
        let harsh = Harsh::builder()
            .salt(salt)
            .length(min_length)
            .build()
            .map_err(|e| HashIdError::Config(e.to_string()))?;
        Ok(Self { harsh })
    }

    /// Encodes a channel id into its public handle.
    #[must_use]
    pub fn encode(&self, id: u64) -> String {
        self.harsh.encode(&[id])
    }

    /// Decodes a public handle back into the channel id it encodes.
    ///
    /// # Errors
    ///
    /// Returns [`HashIdError::Invalid`] for handles not produced by this
    /// codec (wrong salt, tampered, or garbage input).
    pub fn decode(&self, handle: &str) -> Result<u64, HashIdError> {
        let ids = self
            .harsh
            .decode(handle)
            .map_err(|_| HashIdError::Invalid)?;
        match ids.as_slice() {
            [id] => Ok(*id),
            _ => Err(HashIdError::Invalid),
        }
    }
}

/// Hash-id codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashIdError {
    #[error("hash-id codec misconfigured: {0}")]
    Config(String),

    #[error("not a valid channel handle")]
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &str = "unit-test-salt";

    #[test]
    fn encode_decode_identity() {
        let codec = ChannelHash::new(SALT).unwrap();
        for id in [0, 1, 42, 9999, u64::from(u32::MAX), u64::MAX / 2] {
            let handle = codec.encode(id);
            assert_eq!(codec.decode(&handle).unwrap(), id, "id {id}");
        }
    }

    #[test]
    fn handles_meet_minimum_length() {
        let codec = ChannelHash::new(SALT).unwrap();
        assert!(codec.encode(1).len() >= DEFAULT_MIN_LENGTH);
    }

    #[test]
    fn garbage_input_is_rejected() {
        let codec = ChannelHash::new(SALT).unwrap();
        assert_eq!(codec.decode("not-a-handle!"), Err(HashIdError::Invalid));
        assert_eq!(codec.decode(""), Err(HashIdError::Invalid));
    }

    #[test]
    fn different_salt_rejects_foreign_handles() {
        let a = ChannelHash::new(SALT).unwrap();
        let b = ChannelHash::new("another-salt").unwrap();
        let handle = a.encode(7);
        assert!(b.decode(&handle) != Ok(7), "salts must not be interchangeable");
    }

    #[test]
    fn handles_are_deterministic() {
        let codec = ChannelHash::new(SALT).unwrap();
        assert_eq!(codec.encode(123), codec.encode(123));
    }
}
