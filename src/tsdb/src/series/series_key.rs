use std::cmp::Ordering;

use common_base::point::{Tag, Tags};

use crate::codec::varint::{VarInt, MAX_VARINT_LEN64};
use crate::errors::IndexError;

/// Series keys are length-prefixed byte strings:
///
/// ```text
/// uvarint(total size) ‖ u16be(name len) ‖ name ‖ uvarint(tag count) ‖
///     for each tag: u16be(key len) ‖ key ‖ u16be(value len) ‖ value
/// ```
///
/// Tags are sorted by key bytes before encoding. The leading size covers
/// everything after the uvarint itself so a reader can skip a key without
/// parsing it.

fn malformed(msg: &str) -> anyhow::Error {
    IndexError::MalformedKey(msg.to_string()).into()
}

/// series_key_size returns the encoded size of the name/tag data.
/// It does not include the total length prefix.
fn series_key_size(name: &[u8], tags: &Tags) -> usize {
    2 + // size of measurement
        name.len() + // measurement
        tags.len().required_space() + // size of number of tags
        (4 * tags.len()) + // length of each tag key and value
        tags.size() // size of tag keys/values
}

/// append_series_key serializes name and sorted tags onto dst.
pub fn append_series_key(dst: &mut Vec<u8>, name: &[u8], tags: &Tags) {
    let orig_len = dst.len();
    let size = series_key_size(name, tags);

    let mut buf = [0_u8; MAX_VARINT_LEN64];

    // Append total length.
    let n = size.encode_var(&mut buf);
    dst.extend_from_slice(&buf[..n]);

    // Append name.
    dst.extend_from_slice(&(name.len() as u16).to_be_bytes());
    dst.extend_from_slice(name);

    // Append tag count.
    let n = tags.len().encode_var(&mut buf);
    dst.extend_from_slice(&buf[..n]);

    // Append tags.
    for tag in tags.iter() {
        dst.extend_from_slice(&(tag.key.len() as u16).to_be_bytes());
        dst.extend_from_slice(&tag.key);
        dst.extend_from_slice(&(tag.value.len() as u16).to_be_bytes());
        dst.extend_from_slice(&tag.value);
    }

    debug_assert_eq!(
        dst.len() - orig_len,
        size + size.required_space(),
        "series key encoding does not match calculated total length"
    );
}

/// encode_series_key serializes name and sorted tags to a new byte vector.
pub fn encode_series_key(name: &[u8], tags: &Tags) -> Vec<u8> {
    let size = series_key_size(name, tags);
    let mut dst = Vec::with_capacity(size + size.required_space());
    append_series_key(&mut dst, name, tags);
    dst
}

/// read_series_key returns the series key (including its length prefix) from
/// the beginning of the buffer, plus the remainder.
pub fn read_series_key(data: &[u8]) -> anyhow::Result<(&[u8], &[u8])> {
    let (sz, n) = u64::decode_var(data).ok_or_else(|| malformed("length prefix"))?;
    let total = n + sz as usize;
    if data.len() < total {
        return Err(malformed("truncated key"));
    }
    Ok((&data[..total], &data[total..]))
}

/// read_series_key_len consumes the total length prefix.
pub fn read_series_key_len(data: &[u8]) -> anyhow::Result<(usize, &[u8])> {
    let (sz, n) = u64::decode_var(data).ok_or_else(|| malformed("length prefix"))?;
    if data.len() < n + sz as usize {
        return Err(malformed("truncated key"));
    }
    Ok((sz as usize, &data[n..]))
}

/// read_series_key_measurement consumes the measurement name.
pub fn read_series_key_measurement(data: &[u8]) -> anyhow::Result<(&[u8], &[u8])> {
    if data.len() < 2 {
        return Err(malformed("name length"));
    }
    let n = u16::from_be_bytes([data[0], data[1]]) as usize;
    let data = &data[2..];
    if data.len() < n {
        return Err(malformed("truncated name"));
    }
    Ok((&data[..n], &data[n..]))
}

/// read_series_key_tag_n consumes the tag count.
pub fn read_series_key_tag_n(data: &[u8]) -> anyhow::Result<(usize, &[u8])> {
    let (n, sz) = u64::decode_var(data).ok_or_else(|| malformed("tag count"))?;
    Ok((n as usize, &data[sz..]))
}

/// read_series_key_tag consumes one key/value pair.
pub fn read_series_key_tag(data: &[u8]) -> anyhow::Result<(&[u8], &[u8], &[u8])> {
    if data.len() < 2 {
        return Err(malformed("tag key length"));
    }
    let n = u16::from_be_bytes([data[0], data[1]]) as usize;
    let data = &data[2..];
    if data.len() < n {
        return Err(malformed("truncated tag key"));
    }
    let (key, data) = (&data[..n], &data[n..]);

    if data.len() < 2 {
        return Err(malformed("tag value length"));
    }
    let n = u16::from_be_bytes([data[0], data[1]]) as usize;
    let data = &data[2..];
    if data.len() < n {
        return Err(malformed("truncated tag value"));
    }
    let (value, data) = (&data[..n], &data[n..]);

    Ok((key, value, data))
}

/// parse_series_key extracts the name and tags from a series key.
/// A key whose tags are not sorted by key bytes is malformed.
pub fn parse_series_key(data: &[u8]) -> anyhow::Result<(&[u8], Tags)> {
    let (_, data) = read_series_key_len(data)?;
    let (name, data) = read_series_key_measurement(data)?;

    let (tag_n, mut data) = read_series_key_tag_n(data)?;
    let mut tags = Vec::with_capacity(tag_n);
    let mut prev: Option<&[u8]> = None;
    for _ in 0..tag_n {
        let (key, value, rest) = read_series_key_tag(data)?;
        if let Some(p) = prev {
            if p >= key {
                return Err(malformed("tags out of order"));
            }
        }
        prev = Some(key);
        tags.push(Tag::new(key.to_vec(), value.to_vec()));
        data = rest;
    }

    Ok((name, Tags::new(tags)))
}

/// parse_series_key_measurement returns only the measurement name without
/// decoding the tag set.
pub fn parse_series_key_measurement(data: &[u8]) -> anyhow::Result<&[u8]> {
    let (_, data) = read_series_key_len(data)?;
    let (name, _) = read_series_key_measurement(data)?;
    Ok(name)
}

/// compare_series_keys orders two encoded keys by (name, tags), not by raw
/// bytes; the leading uvarint would perturb raw ordering.
pub fn compare_series_keys(a: &[u8], b: &[u8]) -> Ordering {
    // Handle empty keys.
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    // Read total size.
    let a = read_series_key_len(a).map(|(_, rest)| rest).unwrap_or(&[]);
    let b = read_series_key_len(b).map(|(_, rest)| rest).unwrap_or(&[]);

    // Read names.
    let (name0, a) = read_series_key_measurement(a).unwrap_or((&[], &[]));
    let (name1, b) = read_series_key_measurement(b).unwrap_or((&[], &[]));

    // Compare names, return if not equal.
    let cmp = name0.cmp(name1);
    if cmp != Ordering::Equal {
        return cmp;
    }

    // Read tag counts.
    let (tag_n0, mut a) = read_series_key_tag_n(a).unwrap_or((0, &[]));
    let (tag_n1, mut b) = read_series_key_tag_n(b).unwrap_or((0, &[]));

    // Compare each tag in order.
    for i in 0.. {
        if i == tag_n0 && i == tag_n1 {
            return Ordering::Equal;
        } else if i == tag_n0 {
            return Ordering::Less;
        } else if i == tag_n1 {
            return Ordering::Greater;
        }

        let (key0, value0, rest0) = match read_series_key_tag(a) {
            Ok(v) => v,
            Err(_) => return Ordering::Less,
        };
        let (key1, value1, rest1) = match read_series_key_tag(b) {
            Ok(v) => v,
            Err(_) => return Ordering::Greater,
        };
        a = rest0;
        b = rest1;

        let cmp = key0.cmp(key1);
        if cmp != Ordering::Equal {
            return cmp;
        }
        let cmp = value0.cmp(value1);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }

    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&[u8], &[u8])]) -> Tags {
        Tags::from_pairs(pairs.to_vec())
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let t = tags(&[(b"region", b"us-west"), (b"host", b"server01")]);
        let key = encode_series_key(b"cpu", &t);

        let (name, parsed) = parse_series_key(&key).unwrap();
        assert_eq!(name, b"cpu");
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_encode_empty_tags() {
        let key = encode_series_key(b"mem", &Tags::default());
        let (name, parsed) = parse_series_key(&key).unwrap();
        assert_eq!(name, b"mem");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_read_series_key_skips_without_parsing() {
        let t = tags(&[(b"host", b"a")]);
        let mut buf = encode_series_key(b"cpu", &t);
        let second = encode_series_key(b"mem", &Tags::default());
        buf.extend_from_slice(&second);

        let (first, rest) = read_series_key(&buf).unwrap();
        assert_eq!(parse_series_key_measurement(first).unwrap(), b"cpu");
        assert_eq!(rest, second.as_slice());
    }

    #[test]
    fn test_parse_rejects_truncated_key() {
        let t = tags(&[(b"host", b"a")]);
        let key = encode_series_key(b"cpu", &t);
        assert!(parse_series_key(&key[..key.len() - 2]).is_err());
        assert!(read_series_key(&key[..key.len() - 1]).is_err());
    }

    #[test]
    fn test_parse_rejects_unsorted_tags() {
        // Hand-encode b,a in the wrong order.
        let mut unsorted = Tags::default();
        unsorted.push(common_base::point::Tag::new(b"b".to_vec(), b"1".to_vec()));
        unsorted.push(common_base::point::Tag::new(b"a".to_vec(), b"2".to_vec()));

        let size = series_key_size(b"cpu", &unsorted);
        let mut dst = Vec::with_capacity(size + 1);
        let mut buf = [0_u8; MAX_VARINT_LEN64];
        let n = size.encode_var(&mut buf);
        dst.extend_from_slice(&buf[..n]);
        dst.extend_from_slice(&3_u16.to_be_bytes());
        dst.extend_from_slice(b"cpu");
        let n = 2_usize.encode_var(&mut buf);
        dst.extend_from_slice(&buf[..n]);
        for tag in unsorted.iter() {
            dst.extend_from_slice(&(tag.key.len() as u16).to_be_bytes());
            dst.extend_from_slice(&tag.key);
            dst.extend_from_slice(&(tag.value.len() as u16).to_be_bytes());
            dst.extend_from_slice(&tag.value);
        }

        assert!(parse_series_key(&dst).is_err());
    }

    #[test]
    fn test_compare_matches_tuple_order() {
        let a = encode_series_key(b"cpu", &tags(&[(b"host", b"a")]));
        let b = encode_series_key(b"cpu", &tags(&[(b"host", b"b")]));
        let c = encode_series_key(b"cpu", &tags(&[(b"host", b"a"), (b"region", b"us")]));
        let d = encode_series_key(b"mem", &Tags::default());

        assert_eq!(compare_series_keys(&a, &a), Ordering::Equal);
        assert_eq!(compare_series_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_series_keys(&b, &a), Ordering::Greater);
        // Prefix tags order before longer tag sets.
        assert_eq!(compare_series_keys(&a, &c), Ordering::Less);
        // Name dominates.
        assert_eq!(compare_series_keys(&c, &d), Ordering::Less);
    }

    #[test]
    fn test_compare_ignores_prefix_length() {
        // A one-byte name with many tags has a longer body than a two-byte
        // name with none; ordering still follows the name.
        let a = encode_series_key(b"a", &tags(&[(b"k1", b"v1"), (b"k2", b"v2")]));
        let b = encode_series_key(b"ab", &Tags::default());
        assert_eq!(compare_series_keys(&a, &b), Ordering::Less);
    }
}
