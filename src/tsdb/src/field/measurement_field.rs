use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common_base::influxql::DataType;
use common_base::point::FieldValue;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tsidb_storage::StorageOperator;

use crate::codec::varint::{append_uvarint, VarInt};
use crate::errors::IndexError;

/// MAX_STRING_LENGTH is the largest encodable string field payload.
/// Longer values are truncated.
pub const MAX_STRING_LENGTH: usize = 65535;

/// MAX_FIELD_N is the cap on distinct fields per measurement over its
/// lifetime: field ids are one byte and id 0 is never assigned.
pub const MAX_FIELD_N: usize = 255;

/// FIELDS_FILE_NAME names the persisted field schema within a shard dir.
pub const FIELDS_FILE_NAME: &'static str = "fields.idx";

const FIELDS_FILE_MAGIC: &'static str = "FLDS";
const FIELDS_FILE_VERSION: u16 = 1;

/// Field represents a typed column attached to a measurement. Ids are
/// assigned in creation order and are permanent.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub id: u8,
    pub name: String,
    pub data_type: DataType,
}

fn data_type_to_u8(t: DataType) -> u8 {
    match t {
        DataType::Float => 1,
        DataType::Integer => 2,
        DataType::String => 3,
        DataType::Boolean => 4,
        _ => 0,
    }
}

fn data_type_from_u8(v: u8) -> DataType {
    match v {
        1 => DataType::Float,
        2 => DataType::Integer,
        3 => DataType::String,
        4 => DataType::Boolean,
        _ => DataType::Unknown,
    }
}

/// FieldCodec encodes and decodes the fields of a measurement. It is an
/// immutable snapshot: schema extension builds a new codec, so readers are
/// never blocked by writers and are unaffected by later schema changes.
#[derive(Default)]
pub struct FieldCodec {
    fields_by_id: HashMap<u8, Arc<Field>>,
    fields_by_name: HashMap<String, Arc<Field>>,
}

impl FieldCodec {
    pub fn new(fields: Vec<Arc<Field>>) -> Self {
        let mut fields_by_id = HashMap::with_capacity(fields.len());
        let mut fields_by_name = HashMap::with_capacity(fields.len());
        for f in fields {
            fields_by_id.insert(f.id, f.clone());
            fields_by_name.insert(f.name.clone(), f);
        }
        Self {
            fields_by_id,
            fields_by_name,
        }
    }

    pub fn field_n(&self) -> usize {
        self.fields_by_id.len()
    }

    pub fn field(&self, id: u8) -> Option<&Arc<Field>> {
        self.fields_by_id.get(&id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Arc<Field>> {
        self.fields_by_name.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields_by_id.values()
    }

    /// encode_fields converts a field map to a byte stream of field ids and
    /// payloads. Every name must already exist in the codec: encoding an
    /// unknown field is a core bug, not an input error. A value whose type
    /// disagrees with the schema is an input error.
    pub fn encode_fields(
        &self,
        values: &BTreeMap<String, FieldValue>,
        measurement: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let mut b = Vec::with_capacity(values.len() * 10);

        for (name, value) in values {
            let field = self
                .fields_by_name
                .get(name)
                .unwrap_or_else(|| panic!("field does not exist for {}", name));

            if value.data_type() != field.data_type {
                return Err(IndexError::FieldTypeConflict {
                    measurement: String::from_utf8_lossy(measurement).to_string(),
                    field: name.clone(),
                    new: value.data_type(),
                    existing: field.data_type,
                }
                .into());
            }

            b.push(field.id);
            match value {
                FieldValue::Float(v) => {
                    b.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                FieldValue::Integer(v) => {
                    b.extend_from_slice(&(*v as u64).to_be_bytes());
                }
                FieldValue::Boolean(v) => {
                    b.push(*v as u8);
                }
                FieldValue::String(v) => {
                    let v = &v[..v.len().min(MAX_STRING_LENGTH)];
                    b.extend_from_slice(&(v.len() as u16).to_be_bytes());
                    b.extend_from_slice(v);
                }
            }
        }

        Ok(b)
    }

    /// decode_fields decodes a byte stream into field ids and values,
    /// stopping at the end of the buffer. An id missing from the codec means
    /// the reader's schema is stale relative to the writer; the read aborts
    /// with UnmappedFieldId and the caller may retry with a newer codec.
    pub fn decode_fields(&self, mut b: &[u8]) -> anyhow::Result<BTreeMap<u8, FieldValue>> {
        let mut values = BTreeMap::new();

        while !b.is_empty() {
            let field_id = b[0];
            let field = self
                .fields_by_id
                .get(&field_id)
                .ok_or(IndexError::UnmappedFieldId(field_id))?;
            b = &b[1..];

            let value = match field.data_type {
                DataType::Float => {
                    if b.len() < 8 {
                        return Err(IndexError::ShortBuffer.into());
                    }
                    let v = f64::from_bits(u64::from_be_bytes(b[..8].try_into().unwrap()));
                    b = &b[8..];
                    FieldValue::Float(v)
                }
                DataType::Integer => {
                    if b.len() < 8 {
                        return Err(IndexError::ShortBuffer.into());
                    }
                    let v = u64::from_be_bytes(b[..8].try_into().unwrap()) as i64;
                    b = &b[8..];
                    FieldValue::Integer(v)
                }
                DataType::Boolean => {
                    if b.is_empty() {
                        return Err(IndexError::ShortBuffer.into());
                    }
                    let v = b[0] == 1;
                    b = &b[1..];
                    FieldValue::Boolean(v)
                }
                DataType::String => {
                    if b.len() < 2 {
                        return Err(IndexError::ShortBuffer.into());
                    }
                    let size = u16::from_be_bytes([b[0], b[1]]) as usize;
                    b = &b[2..];
                    if b.len() < size {
                        return Err(IndexError::ShortBuffer.into());
                    }
                    let v = b[..size].to_vec();
                    b = &b[size..];
                    FieldValue::String(v)
                }
                other => {
                    return Err(IndexError::Corrupt(format!(
                        "field {} has unsupported type {}",
                        field.name, other
                    ))
                    .into())
                }
            };

            values.insert(field_id, value);
        }

        Ok(values)
    }

    /// decode_fields_with_names decodes a byte stream into named values.
    pub fn decode_fields_with_names(
        &self,
        b: &[u8],
    ) -> anyhow::Result<BTreeMap<String, FieldValue>> {
        let fields = self.decode_fields(b)?;
        let mut m = BTreeMap::new();
        for (id, v) in fields {
            if let Some(field) = self.fields_by_id.get(&id) {
                m.insert(field.name.clone(), v);
            }
        }
        Ok(m)
    }
}

/// MeasurementFields maintains a measurement's field schema behind a swap
/// lock: every extension installs a fresh codec snapshot.
pub struct MeasurementFields {
    name: Vec<u8>,
    codec: RwLock<Arc<FieldCodec>>,
}

impl MeasurementFields {
    pub fn new(name: Vec<u8>) -> Self {
        Self {
            name,
            codec: RwLock::new(Arc::new(FieldCodec::default())),
        }
    }

    /// codec returns the current immutable codec snapshot.
    pub fn codec(&self) -> Arc<FieldCodec> {
        self.codec.read().clone()
    }

    pub fn field_n(&self) -> usize {
        self.codec.read().field_n()
    }

    pub fn field_by_name(&self, name: &str) -> Option<Arc<Field>> {
        self.codec.read().field_by_name(name).cloned()
    }

    /// create_field_if_not_exists registers a field, assigning the next id.
    /// Returns true if the field was created. The 256th distinct field fails
    /// with FieldOverflow without mutating the schema; a same-name field of
    /// a different type fails with FieldTypeConflict.
    pub fn create_field_if_not_exists(
        &self,
        name: &str,
        data_type: DataType,
    ) -> anyhow::Result<bool> {
        // Common path: field already in the snapshot.
        {
            let codec = self.codec.read();
            if let Some(f) = codec.field_by_name(name) {
                if f.data_type == data_type {
                    return Ok(false);
                }
                return Err(self.type_conflict(name, data_type, f.data_type));
            }
        }

        let mut codec = self.codec.write();
        if let Some(f) = codec.field_by_name(name) {
            if f.data_type == data_type {
                return Ok(false);
            }
            return Err(self.type_conflict(name, data_type, f.data_type));
        }

        if codec.field_n() >= MAX_FIELD_N {
            return Err(IndexError::FieldOverflow {
                measurement: String::from_utf8_lossy(&self.name).to_string(),
            }
            .into());
        }

        let next_id = codec.fields().map(|f| f.id).max().unwrap_or(0) + 1;
        let mut fields: Vec<Arc<Field>> = codec.fields().cloned().collect();
        fields.push(Arc::new(Field {
            id: next_id,
            name: name.to_string(),
            data_type,
        }));
        *codec = Arc::new(FieldCodec::new(fields));

        Ok(true)
    }

    fn type_conflict(&self, field: &str, new: DataType, existing: DataType) -> anyhow::Error {
        IndexError::FieldTypeConflict {
            measurement: String::from_utf8_lossy(&self.name).to_string(),
            field: field.to_string(),
            new,
            existing,
        }
        .into()
    }
}

/// MeasurementFieldSet owns the field schemas of every measurement in a
/// shard and persists them to fields.idx so ids survive reopen.
pub struct MeasurementFieldSet {
    op: StorageOperator,
    measure_fields: DashMap<Vec<u8>, Arc<MeasurementFields>>,
}

impl MeasurementFieldSet {
    pub fn new(op: StorageOperator) -> Self {
        Self {
            op,
            measure_fields: DashMap::new(),
        }
    }

    /// fields returns the schema for a measurement, if any fields exist.
    pub fn fields(&self, name: &[u8]) -> Option<Arc<MeasurementFields>> {
        self.measure_fields.get(name).map(|e| e.value().clone())
    }

    /// create_fields_if_not_exists returns the schema for a measurement,
    /// creating an empty one on first use.
    pub fn create_fields_if_not_exists(&self, name: &[u8]) -> Arc<MeasurementFields> {
        self.measure_fields
            .entry(name.to_vec())
            .or_insert_with(|| Arc::new(MeasurementFields::new(name.to_vec())))
            .value()
            .clone()
    }

    /// delete drops a measurement's schema. Field ids are permanent only
    /// within a measurement lifetime; a dropped measurement starts over.
    pub fn delete(&self, name: &[u8]) {
        self.measure_fields.remove(name);
    }

    pub fn measurement_names(&self) -> Vec<Vec<u8>> {
        self.measure_fields.iter().map(|e| e.key().clone()).collect()
    }

    /// save writes the field schemas to fields.idx via a temp file rename.
    pub async fn save(&self) -> anyhow::Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(FIELDS_FILE_MAGIC.as_bytes());
        body.extend_from_slice(&FIELDS_FILE_VERSION.to_be_bytes());

        let mut names = self.measurement_names();
        names.sort();
        append_uvarint(&mut body, names.len() as u64);
        for name in names {
            let mf = match self.fields(&name) {
                Some(mf) => mf,
                None => continue,
            };
            let codec = mf.codec();
            let mut fields: Vec<Arc<Field>> = codec.fields().cloned().collect();
            fields.sort_by_key(|f| f.id);

            append_uvarint(&mut body, name.len() as u64);
            body.extend_from_slice(&name);
            append_uvarint(&mut body, fields.len() as u64);
            for f in fields {
                body.push(f.id);
                body.push(data_type_to_u8(f.data_type));
                append_uvarint(&mut body, f.name.len() as u64);
                body.extend_from_slice(f.name.as_bytes());
            }
        }

        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let tmp_path = format!("{}.tmp", self.op.path());
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(&body).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, self.op.path()).await?;

        Ok(())
    }

    /// load restores schemas from fields.idx, if present.
    pub async fn load(&self) -> anyhow::Result<()> {
        if !self.op.exist().await? {
            return Ok(());
        }

        let body = tokio::fs::read(self.op.path()).await?;
        if body.len() < FIELDS_FILE_MAGIC.len() + 2 + 4 {
            return Err(IndexError::Corrupt("fields.idx too short".to_string()).into());
        }
        if &body[..4] != FIELDS_FILE_MAGIC.as_bytes() {
            return Err(IndexError::Corrupt("fields.idx bad magic".to_string()).into());
        }
        let version = u16::from_be_bytes([body[4], body[5]]);
        if version != FIELDS_FILE_VERSION {
            return Err(
                IndexError::Corrupt(format!("fields.idx version {}", version)).into(),
            );
        }

        let (payload, crc_bytes) = body.split_at(body.len() - 4);
        let crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != crc {
            return Err(IndexError::Corrupt("fields.idx checksum mismatch".to_string()).into());
        }

        let mut b = &payload[6..];
        let (measurement_n, n) =
            u64::decode_var(b).ok_or(IndexError::Corrupt("fields.idx count".to_string()))?;
        b = &b[n..];

        for _ in 0..measurement_n {
            let (name_len, n) = u64::decode_var(b)
                .ok_or(IndexError::Corrupt("fields.idx name len".to_string()))?;
            b = &b[n..];
            if b.len() < name_len as usize {
                return Err(IndexError::ShortBuffer.into());
            }
            let name = b[..name_len as usize].to_vec();
            b = &b[name_len as usize..];

            let (field_n, n) = u64::decode_var(b)
                .ok_or(IndexError::Corrupt("fields.idx field count".to_string()))?;
            b = &b[n..];

            let mut fields = Vec::with_capacity(field_n as usize);
            for _ in 0..field_n {
                if b.len() < 2 {
                    return Err(IndexError::ShortBuffer.into());
                }
                let id = b[0];
                let data_type = data_type_from_u8(b[1]);
                b = &b[2..];

                let (fname_len, n) = u64::decode_var(b)
                    .ok_or(IndexError::Corrupt("fields.idx field name".to_string()))?;
                b = &b[n..];
                if b.len() < fname_len as usize {
                    return Err(IndexError::ShortBuffer.into());
                }
                let fname = String::from_utf8_lossy(&b[..fname_len as usize]).to_string();
                b = &b[fname_len as usize..];

                fields.push(Arc::new(Field {
                    id,
                    name: fname,
                    data_type,
                }));
            }

            let mf = MeasurementFields::new(name.clone());
            *mf.codec.write() = Arc::new(FieldCodec::new(fields));
            self.measure_fields.insert(name, Arc::new(mf));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fields() -> MeasurementFields {
        MeasurementFields::new(b"cpu".to_vec())
    }

    #[test]
    fn test_create_and_encode_decode() {
        let mf = new_fields();
        assert!(mf
            .create_field_if_not_exists("value", DataType::Float)
            .unwrap());
        assert!(mf
            .create_field_if_not_exists("status", DataType::String)
            .unwrap());
        assert!(!mf
            .create_field_if_not_exists("value", DataType::Float)
            .unwrap());

        let codec = mf.codec();
        assert_eq!(codec.field_by_name("value").unwrap().id, 1);
        assert_eq!(codec.field_by_name("status").unwrap().id, 2);

        let mut values = BTreeMap::new();
        values.insert("value".to_string(), FieldValue::Float(23.2));
        values.insert("status".to_string(), FieldValue::String(b"ok".to_vec()));

        let buf = codec.encode_fields(&values, b"cpu").unwrap();
        let decoded = codec.decode_fields_with_names(&buf).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_all_value_types_round_trip() {
        let mf = new_fields();
        mf.create_field_if_not_exists("f", DataType::Float).unwrap();
        mf.create_field_if_not_exists("i", DataType::Integer)
            .unwrap();
        mf.create_field_if_not_exists("b", DataType::Boolean)
            .unwrap();
        mf.create_field_if_not_exists("s", DataType::String).unwrap();

        let codec = mf.codec();
        let mut values = BTreeMap::new();
        values.insert("f".to_string(), FieldValue::Float(-1.5));
        values.insert("i".to_string(), FieldValue::Integer(-42));
        values.insert("b".to_string(), FieldValue::Boolean(true));
        values.insert("s".to_string(), FieldValue::String(b"text".to_vec()));

        let buf = codec.encode_fields(&values, b"cpu").unwrap();
        assert_eq!(codec.decode_fields_with_names(&buf).unwrap(), values);
    }

    #[test]
    fn test_string_truncated_to_max_length() {
        let mf = new_fields();
        mf.create_field_if_not_exists("s", DataType::String).unwrap();
        let codec = mf.codec();

        let mut values = BTreeMap::new();
        values.insert("s".to_string(), FieldValue::String(vec![b'x'; 100_000]));

        let buf = codec.encode_fields(&values, b"cpu").unwrap();
        let decoded = codec.decode_fields_with_names(&buf).unwrap();
        match decoded.get("s").unwrap() {
            FieldValue::String(v) => assert_eq!(v.len(), MAX_STRING_LENGTH),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_type_conflict() {
        let mf = new_fields();
        mf.create_field_if_not_exists("value", DataType::Float)
            .unwrap();
        let err = mf
            .create_field_if_not_exists("value", DataType::Integer)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::FieldTypeConflict { .. })
        ));
    }

    #[test]
    fn test_field_overflow_leaves_schema_unchanged() {
        let mf = new_fields();
        for i in 0..MAX_FIELD_N {
            assert!(mf
                .create_field_if_not_exists(&format!("f{}", i), DataType::Float)
                .unwrap());
        }
        let err = mf
            .create_field_if_not_exists("one-too-many", DataType::Float)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::FieldOverflow { .. })
        ));
        assert_eq!(mf.field_n(), MAX_FIELD_N);
        assert!(mf.field_by_name("one-too-many").is_none());
    }

    #[test]
    fn test_unmapped_field_id() {
        let mf = new_fields();
        mf.create_field_if_not_exists("value", DataType::Float)
            .unwrap();
        let codec = mf.codec();

        let mut values = BTreeMap::new();
        values.insert("value".to_string(), FieldValue::Float(1.0));
        let mut buf = codec.encode_fields(&values, b"cpu").unwrap();
        buf[0] = 99; // an id the codec has never assigned

        let err = codec.decode_fields(&buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::UnmappedFieldId(99))
        ));
    }

    #[test]
    fn test_stale_codec_decodes_with_new_snapshot() {
        let mf = new_fields();
        mf.create_field_if_not_exists("value", DataType::Float)
            .unwrap();
        let stale = mf.codec();

        mf.create_field_if_not_exists("extra", DataType::Integer)
            .unwrap();
        let fresh = mf.codec();

        let mut values = BTreeMap::new();
        values.insert("value".to_string(), FieldValue::Float(1.0));
        values.insert("extra".to_string(), FieldValue::Integer(7));
        let buf = fresh.encode_fields(&values, b"cpu").unwrap();

        assert!(stale.decode_fields(&buf).is_err());
        assert_eq!(fresh.decode_fields_with_names(&buf).unwrap(), values);
    }

    #[tokio::test]
    async fn test_field_set_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.as_ref().join(FIELDS_FILE_NAME);
        let op = tsidb_storage::StorageOperator::root(path.to_str().unwrap()).unwrap();

        {
            let set = MeasurementFieldSet::new(op.clone());
            let mf = set.create_fields_if_not_exists(b"cpu");
            mf.create_field_if_not_exists("value", DataType::Float)
                .unwrap();
            mf.create_field_if_not_exists("status", DataType::String)
                .unwrap();
            set.create_fields_if_not_exists(b"mem")
                .create_field_if_not_exists("used", DataType::Integer)
                .unwrap();
            set.save().await.unwrap();
        }

        let set = MeasurementFieldSet::new(op);
        set.load().await.unwrap();

        let mf = set.fields(b"cpu").unwrap();
        let value = mf.field_by_name("value").unwrap();
        assert_eq!(value.id, 1);
        assert_eq!(value.data_type, DataType::Float);
        assert_eq!(mf.field_by_name("status").unwrap().id, 2);
        assert_eq!(
            set.fields(b"mem").unwrap().field_by_name("used").unwrap().data_type,
            DataType::Integer
        );
    }
}
