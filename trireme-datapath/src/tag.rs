use crate::error::TokenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// An ordered sequence of key=value pairs advertised on outbound flows.
/// Order matters: earlier tags are the first ones preserved when a token
/// has to be truncated to fit the TCP option budget (see `token.rs`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagStore(Vec<Tag>);

impl TagStore {
    pub fn new() -> Self {
        TagStore(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Tag { key: key.into(), value: value.into() });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0.iter().any(|t| t.key == key && t.value == value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Truncates to the longest prefix (in insertion order) whose wire
    /// encoding fits within `budget` bytes. Returns whether any tag had to
    /// be dropped.
    pub fn truncate_to_budget(&self, budget: usize) -> (TagStore, bool) {
        let mut kept = TagStore::new();
        let mut used = 0usize;
        for tag in &self.0 {
            let size = tag_wire_size(tag);
            if used + size > budget {
                return (kept, true);
            }
            used += size;
            kept.0.push(tag.clone());
        }
        (kept, false)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for tag in &self.0 {
            out.push(tag.key.len() as u8);
            out.extend_from_slice(tag.key.as_bytes());
            out.push(tag.value.len() as u8);
            out.extend_from_slice(tag.value.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<TagStore, TokenError> {
        let mut store = TagStore::new();
        let mut i = 0;
        while i < bytes.len() {
            let (key, next) = read_field(bytes, i)?;
            let (value, next) = read_field(bytes, next)?;
            store.push(key, value);
            i = next;
        }
        Ok(store)
    }
}

fn tag_wire_size(tag: &Tag) -> usize {
    1 + tag.key.len() + 1 + tag.value.len()
}

fn read_field(bytes: &[u8], i: usize) -> Result<(String, usize), TokenError> {
    if i >= bytes.len() {
        return Err(TokenError::Malformed("truncated tag length byte".into()));
    }
    let len = bytes[i] as usize;
    let start = i + 1;
    let end = start + len;
    if end > bytes.len() {
        return Err(TokenError::Malformed("tag field runs past end of buffer".into()));
    }
    let s = std::str::from_utf8(&bytes[start..end]).map_err(|e| TokenError::Malformed(e.to_string()))?;
    Ok((s.to_string(), end))
}

impl FromIterator<(String, String)> for TagStore {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut store = TagStore::new();
        for (k, v) in iter {
            store.push(k, v);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let mut tags = TagStore::new();
        tags.push("app", "web");
        tags.push("ns", "prod");
        let decoded = TagStore::decode(&tags.encode()).unwrap();
        assert_eq!(tags, decoded);
    }

    #[test]
    fn truncate_keeps_longest_affordable_prefix() {
        let mut tags = TagStore::new();
        tags.push("a", "1");
        tags.push("bb", "22");
        tags.push("ccc", "333");
        let (kept, overflowed) = tags.truncate_to_budget(6);
        assert!(overflowed);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("a"), Some("1"));
    }

    #[test]
    fn truncate_reports_no_overflow_when_everything_fits() {
        let mut tags = TagStore::new();
        tags.push("a", "1");
        let (kept, overflowed) = tags.truncate_to_budget(100);
        assert!(!overflowed);
        assert_eq!(kept, tags);
    }
}
