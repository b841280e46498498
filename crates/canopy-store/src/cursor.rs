//! Opaque pagination cursors.
//!
//! A cursor carries the last storage key a page returned, hex-encoded and
//! tagged with a blake3 digest over the listing scope. A cursor is only
//! accepted by the listing that produced it.

use crate::client::StoreError;

const TAG_LEN: usize = 16;

/// Encode `position` (a storage key) as a cursor bound to `scope`.
pub fn encode(scope: &str, position: &str) -> String {
    let body: String = position.bytes().map(|b| format!("{b:02x}")).collect();
    format!("{body}.{}", tag(scope, position))
}

/// Recover the storage key from a cursor produced by [`encode`] for `scope`.
pub fn decode(scope: &str, token: &str) -> Result<String, StoreError> {
    let (body, given) = token
        .split_once('.')
        .ok_or_else(|| StoreError::InvalidCursor("missing tag".to_string()))?;

    if body.len() % 2 != 0 {
        return Err(StoreError::InvalidCursor("odd-length body".to_string()));
    }
    let bytes = (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| StoreError::InvalidCursor("body is not hex".to_string()))?;
    let position = String::from_utf8(bytes)
        .map_err(|_| StoreError::InvalidCursor("body is not utf-8".to_string()))?;

    if tag(scope, &position) != given {
        return Err(StoreError::InvalidCursor(
            "cursor does not belong to this listing".to_string(),
        ));
    }
    Ok(position)
}

fn tag(scope: &str, position: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"|");
    hasher.update(position.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..TAG_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_own_cursor() {
        let token = encode("coll/a/users", "t/x/coll/a/users/m/000001/b");
        assert_eq!(
            decode("coll/a/users", &token).unwrap(),
            "t/x/coll/a/users/m/000001/b"
        );
    }

    #[test]
    fn rejects_cursor_from_other_scope() {
        let token = encode("coll/a/users", "k");
        assert!(matches!(
            decode("coll/a/groups", &token),
            Err(StoreError::InvalidCursor(_))
        ));
    }

    #[test]
    fn rejects_tampered_or_garbage_cursors() {
        let token = encode("s", "key-1");
        let tampered = token.replacen("6b", "6c", 1);
        assert!(decode("s", &tampered).is_err());
        assert!(decode("s", "not-a-cursor").is_err());
        assert!(decode("s", "zz.0123456789abcdef").is_err());
        assert!(decode("s", "abc.0123456789abcdef").is_err());
    }
}
