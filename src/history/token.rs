use crate::types::{LedgerError, SequenceNumber};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque continuation token for history pages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    /// Token resuming after `seq`
    pub fn encode(seq: SequenceNumber) -> Self {
        Self(URL_SAFE_NO_PAD.encode(seq.to_be_bytes()))
    }

    /// Sequence number the next page starts after
    pub fn decode(&self) -> Result<SequenceNumber, LedgerError> {
        let invalid = || LedgerError::InvalidPageToken {
            token: self.0.clone(),
        };

        let bytes = URL_SAFE_NO_PAD.decode(&self.0).map_err(|_| invalid())?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| invalid())?;
        Ok(SequenceNumber::from_be_bytes(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(1)]
    #[case::large(u64::MAX)]
    fn test_token_resumes_after_sequence(#[case] seq: SequenceNumber) {
        assert_eq!(PageToken::encode(seq).decode(), Ok(seq));
    }

    #[rstest]
    #[case::not_base64("%%%")]
    #[case::wrong_length("AAAA")]
    #[case::empty("")]
    fn test_malformed_tokens(#[case] raw: &str) {
        let result = PageToken::from(raw).decode();
        assert_eq!(
            result,
            Err(LedgerError::InvalidPageToken {
                token: raw.to_string()
            })
        );
    }
}
