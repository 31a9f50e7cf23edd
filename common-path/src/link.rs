//! Value-level link sigil: `{"/": {"link@1": {"id": .., "path": [..]}}}`.

use crate::{Entity, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value-level reference to another location, optionally tagged as a
/// write-redirect (spec.md §3, §4.1): reads follow every link, but only
/// write-redirect links absorb writes made through the cell that resolved
/// them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// Target entity.
    pub id: Entity,
    /// Target path within that entity.
    pub path: PathBuf,
    /// Whether writes through the resolving cell should redirect here.
    pub write_redirect: bool,
}

impl Link {
    /// A plain inline link (followed on read only).
    pub fn inline(id: Entity, path: PathBuf) -> Self {
        Self {
            id,
            path,
            write_redirect: false,
        }
    }

    /// A write-redirect link (followed on read and write).
    pub fn write_redirect(id: Entity, path: PathBuf) -> Self {
        Self {
            id,
            path,
            write_redirect: true,
        }
    }

    /// Serializes to the canonical sigil JSON form. Write-redirect links
    /// carry an extra `"redirect": true` marker inside the envelope so the
    /// cell layer and fact store can distinguish them without a side table.
    pub fn to_json(&self) -> Value {
        let tokens: Vec<Value> = self
            .path
            .tokens()
            .iter()
            .map(|t| match t {
                crate::Token::Field(s) => Value::String(s.clone()),
                crate::Token::Index(i) => Value::Number((*i).into()),
            })
            .collect();
        let mut inner = serde_json::json!({
            "id": self.id.as_str(),
            "path": tokens,
        });
        if self.write_redirect {
            inner["redirect"] = Value::Bool(true);
        }
        serde_json::json!({ "/": { "link@1": inner } })
    }

    /// Recognizes and parses the sigil form; returns `None` for any other
    /// shaped value (an ordinary JSON object or array is not a link).
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let sigil = obj.get("/")?.as_object()?;
        let inner = sigil.get("link@1")?.as_object()?;
        let id = Entity::new(inner.get("id")?.as_str()?);
        let tokens: Vec<crate::Token> = inner
            .get("path")?
            .as_array()?
            .iter()
            .map(|v| {
                if let Some(s) = v.as_str() {
                    crate::Token::field(s)
                } else {
                    crate::Token::index(v.as_u64().unwrap_or_default() as usize)
                }
            })
            .collect();
        let write_redirect = inner.get("redirect").and_then(Value::as_bool).unwrap_or(false);
        Some(Self {
            id,
            path: PathBuf::from_tokens(&tokens),
            write_redirect,
        })
    }

    /// True if `value` is shaped like a link sigil (cheaper than a full
    /// parse for callers that only need to branch on link-ness).
    pub fn is_link_shaped(value: &Value) -> bool {
        value
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.get("/"))
            .and_then(Value::as_object)
            .map(|o| o.contains_key("link@1"))
            .unwrap_or(false)
    }
}

impl Serialize for Link {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Link::from_json(&value).ok_or_else(|| serde::de::Error::custom("not a link sigil"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Token;

    #[test]
    fn round_trips_through_json() {
        let link = Link::write_redirect(
            Entity::new("of:abc"),
            PathBuf::from_tokens(&[Token::field("todos"), Token::index(0)]),
        );
        let json = link.to_json();
        assert!(Link::is_link_shaped(&json));
        let parsed = Link::from_json(&json).unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn ordinary_object_is_not_a_link() {
        let value = serde_json::json!({"a": 1});
        assert!(!Link::is_link_shaped(&value));
        assert!(Link::from_json(&value).is_none());
    }

    #[test]
    fn inline_link_has_no_redirect_marker() {
        let link = Link::inline(Entity::new("of:x"), PathBuf::root());
        let json = link.to_json();
        assert!(json["/"]["link@1"].get("redirect").is_none());
    }
}
