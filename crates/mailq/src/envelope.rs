use serde::{Deserialize, Serialize};

/// A single delivery attempt's worth of mail: one sender, one or more
/// recipients that all share `host`, and the raw RFC5322 message bytes.
///
/// The stored representation is self-describing JSON; unknown fields are
/// ignored on read and `retry` defaults to zero, so records written by
/// older or newer builds remain loadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination domain, as it appears after the `@` of the recipients.
    pub host: String,
    /// RFC5321 reverse-path mailbox.
    pub from: String,
    /// Forward-path mailboxes, in submission order.
    pub to: Vec<String>,
    /// The assembled message, exactly as submitted.
    pub data: Vec<u8>,
    /// Completed delivery attempts beyond the first.
    #[serde(default)]
    pub retry: u32,
}

impl Envelope {
    pub fn new(host: String, from: String, to: Vec<String>, data: Vec<u8>) -> Self {
        Self {
            host,
            from,
            to,
            data,
            retry: 0,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_round_trip() {
        let env = Envelope::new(
            "example.net".to_string(),
            "sender@example.org".to_string(),
            vec!["a@example.net".to_string(), "b@example.net".to_string()],
            b"Subject: hi\r\n\r\nbody\r\n".to_vec(),
        );
        let bytes = env.encode().unwrap();
        k9::assert_equal!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn tolerates_added_fields() {
        // A record written by a future build with an extra optional field
        // must still decode.
        let bytes = br#"{"host":"h","from":"f","to":["x@h"],"data":[104,105],"retry":2,"priority":9}"#;
        let env = Envelope::decode(bytes).unwrap();
        k9::assert_equal!(env.retry, 2);
        k9::assert_equal!(env.data, b"hi".to_vec());
    }

    #[test]
    fn retry_defaults_to_zero() {
        let bytes = br#"{"host":"h","from":"f","to":["x@h"],"data":[]}"#;
        k9::assert_equal!(Envelope::decode(bytes).unwrap().retry, 0);
    }
}
