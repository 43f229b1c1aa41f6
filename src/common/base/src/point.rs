use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::str::from_utf8_unchecked;

use crate::influxql::DataType;

/// ZERO_TIME is the Unix nanosecond timestamp for no time.
/// This time is not used by the query engine or the storage engine as a valid time.
pub const ZERO_TIME: i64 = i64::MIN;

/// TIME_TAG is the reserved tag and field name for timestamps.
/// Points carrying it have it stripped on the write path.
pub const TIME_TAG: &'static [u8] = b"time";

/// MEASUREMENT_TAG is the pseudo tag key bound to the measurement name in
/// tag predicates.
pub const MEASUREMENT_TAG: &'static str = "_name";

/// is_system_tag_key returns true for reserved tag keys (leading underscore).
pub fn is_system_tag_key(key: &[u8]) -> bool {
    key.first() == Some(&b'_')
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let key = unsafe { from_utf8_unchecked(self.key.as_slice()) };
        let value = unsafe { from_utf8_unchecked(self.value.as_slice()) };

        f.debug_struct("Tag")
            .field("key", &key)
            .field("value", &value)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags(Vec<Tag>);

impl Tags {
    pub fn new(tags: Vec<Tag>) -> Self {
        Self(tags)
    }

    /// from_pairs builds a sorted tag set from (key, value) byte pairs.
    pub fn from_pairs(pairs: Vec<(&[u8], &[u8])>) -> Self {
        let mut tags = Self(
            pairs
                .into_iter()
                .map(|(k, v)| Tag::new(k.to_vec(), v.to_vec()))
                .collect(),
        );
        tags.sort();
        tags
    }

    /// size returns the total byte size of all keys and values.
    pub fn size(&self) -> usize {
        self.0.iter().map(|x| x.size()).sum()
    }

    /// sort orders tags canonically by key bytes.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// get returns the value for a tag key, if present.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|t| t.key.as_slice() == key)
            .map(|t| t.value.as_slice())
    }

    /// remove deletes the tag with the given key, returning true if it existed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let n = self.0.len();
        self.0.retain(|t| t.key.as_slice() != key);
        self.0.len() != n
    }

    pub fn push(&mut self, tag: Tag) {
        self.0.push(tag);
    }

    pub fn into_inner(self) -> Vec<Tag> {
        self.0
    }
}

impl Deref for Tags {
    type Target = [Tag];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

/// FieldValue is a field's dynamic value as a tagged variant.
/// Type inspection derives from the variant tag.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(Vec<u8>),
}

impl FieldValue {
    /// data_type returns the schema type the value maps to.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Float(_) => DataType::Float,
            Self::Integer(_) => DataType::Integer,
            Self::Boolean(_) => DataType::Boolean,
            Self::String(_) => DataType::String,
        }
    }
}

/// Point is a transient ingest record. It lives only through the write path;
/// storage holds its encoded form.
#[derive(Clone, Debug)]
pub struct Point {
    name: Vec<u8>,
    tags: Tags,
    time: i64,
    fields: BTreeMap<String, FieldValue>,
}

impl Point {
    pub fn new(
        name: Vec<u8>,
        mut tags: Tags,
        time: i64,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        tags.sort();
        Self {
            name,
            tags,
            time,
            fields,
        }
    }

    pub fn name(&self) -> &[u8] {
        self.name.as_slice()
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, FieldValue> {
        &mut self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_sorted_from_pairs() {
        let tags =
            Tags::from_pairs(vec![(b"region".as_slice(), b"us".as_slice()), (b"host", b"a")]);
        assert_eq!(tags[0].key, b"host".to_vec());
        assert_eq!(tags[1].key, b"region".to_vec());
        assert_eq!(tags.get(b"host"), Some(b"a".as_slice()));
        assert_eq!(tags.get(b"missing"), None);
    }

    #[test]
    fn test_field_value_types() {
        assert_eq!(FieldValue::Float(1.0).data_type(), DataType::Float);
        assert_eq!(FieldValue::Integer(1).data_type(), DataType::Integer);
        assert_eq!(FieldValue::Boolean(true).data_type(), DataType::Boolean);
        assert_eq!(
            FieldValue::String(b"x".to_vec()).data_type(),
            DataType::String
        );
    }
}
