//! Store keys
//!
//! Keys are caller-supplied and totally ordered: every integer key sorts
//! before every text key, integers numerically, text by UTF-8 bytes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Bytes charged against the quota for this key
    pub fn stored_len(&self) -> u64 {
        match self {
            Key::Int(_) => 8,
            Key::Text(s) => s.len() as u64,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Int(_) => None,
            Key::Text(s) => Some(s),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            Key::Text(_) => None,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value.into())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Key::Text(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_order() {
        let mut keys = vec![
            Key::from("b"),
            Key::from(10),
            Key::from("a"),
            Key::from(-3),
            Key::from("B"),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::Int(-3),
                Key::Int(10),
                Key::Text("B".to_string()),
                Key::Text("a".to_string()),
                Key::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Key::from(42).as_int(), Some(42));
        assert_eq!(Key::from(42).as_str(), None);
        assert_eq!(Key::from("jar").as_str(), Some("jar"));
        assert_eq!(Key::from("jar").as_int(), None);
        assert_eq!(Key::from("jar").stored_len(), 3);
        assert_eq!(Key::from(-1).stored_len(), 8);
    }

    #[test]
    fn test_untagged_serde() {
        let keys: Vec<Key> = serde_json::from_str(r#"[1, "one"]"#).unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::from("one")]);
        assert_eq!(serde_json::to_string(&keys).unwrap(), r#"[1,"one"]"#);
    }
}
