use crate::error::{Error, ErrorKind, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An opaque pagination token. The encoded state is adapter-private;
/// callers hold the token and hand it back verbatim to resume a stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_token(&self) -> &str {
        &self.0
    }

    /// Encode adapter-private cursor state as a base64 token.
    pub fn encode<T: Serialize>(operation: &'static str, state: &T) -> Result<Self> {
        let json = serde_json::to_vec(state).map_err(|err| {
            Error::new(ErrorKind::InvalidData, operation, "failed to encode cursor")
                .with_source(err)
        })?;
        Ok(Self(base64::encode(json)))
    }

    /// Decode the token back into adapter-private state. A token minted by
    /// a different adapter or store fails with `InvalidData`.
    pub fn decode<T: DeserializeOwned>(&self, operation: &'static str) -> Result<T> {
        let bytes = base64::decode(&self.0).map_err(|err| {
            Error::new(ErrorKind::InvalidData, operation, "cursor token is not base64")
                .with_source(err)
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(
                ErrorKind::InvalidData,
                operation,
                "cursor state does not match this adapter",
            )
            .with_source(err)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct State {
        last_id: i64,
    }

    #[test]
    fn cursor_round_trips_state() {
        let cursor = Cursor::encode("stream", &State { last_id: 42 }).unwrap();
        let state: State = cursor.decode("stream").unwrap();
        assert_eq!(state, State { last_id: 42 });
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let cursor = Cursor::from_token("not base64!");
        let err = cursor.decode::<State>("stream").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidData);
    }
}
