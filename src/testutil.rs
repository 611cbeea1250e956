//! In-memory fakes for the store traits, used by unit tests across the
//! crate so `catalog`/`jobs`/`worker` tests don't need a real MongoDB or S3
//! endpoint.

use crate::metadata::{MetadataError, MetadataStore};
use crate::storage::{BodyStream, ObjectStore, PutResult, StorageError};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A collection-keyed store of BSON documents, guarded by one mutex —
/// adequate for single-threaded test scenarios, not a production store.
#[derive(Default)]
pub struct FakeMetadataStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl FakeMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(doc: &Document, filter: &Document) -> bool {
        filter.iter().all(|(k, v)| Self::matches_field(doc, k, v))
    }

    fn matches_field(doc: &Document, key: &str, expected: &Bson) -> bool {
        if key == "$or" {
            if let Bson::Array(alternatives) = expected {
                return alternatives.iter().any(|alt| {
                    alt.as_document()
                        .map(|sub| Self::matches(doc, sub))
                        .unwrap_or(false)
                });
            }
            return false;
        }

        let actual = get_path(doc, key);
        match expected {
            Bson::Document(operators) if operators.keys().all(|k| k.starts_with('$')) => {
                operators.iter().all(|(op, operand)| {
                    Self::matches_operator(actual.as_ref(), op, operand)
                })
            }
            _ => actual.as_ref() == Some(expected),
        }
    }

    fn matches_operator(actual: Option<&Bson>, op: &str, operand: &Bson) -> bool {
        match (actual, op) {
            (Some(a), "$lt") => bson_cmp(a, operand).is_lt(),
            (Some(a), "$lte") => bson_cmp(a, operand).is_le(),
            (Some(a), "$gt") => bson_cmp(a, operand).is_gt(),
            (Some(a), "$gte") => bson_cmp(a, operand).is_ge(),
            (a, "$eq") => a == Some(operand),
            (a, "$ne") => a != Some(operand),
            _ => false,
        }
    }
}

fn bson_cmp(a: &Bson, b: &Bson) -> std::cmp::Ordering {
    match (a, b) {
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.cmp(y),
        _ => bson_as_i64(a).cmp(&bson_as_i64(b)),
    }
}

#[async_trait]
impl MetadataStore for FakeMetadataStore {
    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<ObjectId, MetadataError> {
        let id = ObjectId::new();
        doc.insert("_id", Bson::ObjectId(id));
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), MetadataError> {
        let mut guard = self.collections.lock();
        let entries = guard.entry(collection.to_string()).or_default();
        for mut doc in docs {
            if doc.get("_id").is_none() {
                doc.insert("_id", Bson::ObjectId(ObjectId::new()));
            }
            entries.push(doc);
        }
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, MetadataError> {
        let guard = self.collections.lock();
        Ok(guard
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| Self::matches(d, &filter)).cloned()))
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>, MetadataError> {
        let mut guard = self.collections.lock();
        let entries = guard.entry(collection.to_string()).or_default();

        let mut candidate_indices: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, d)| Self::matches(d, &filter))
            .map(|(i, _)| i)
            .collect();

        if let Some(sort_doc) = sort {
            let keys: Vec<(String, bool)> = sort_doc
                .iter()
                .map(|(k, dir)| (k.clone(), dir.as_i32().unwrap_or(1) >= 0))
                .collect();
            candidate_indices.sort_by(|&a, &b| {
                for (key, ascending) in &keys {
                    let va = get_path(&entries[a], key);
                    let vb = get_path(&entries[b], key);
                    let ord = match (&va, &vb) {
                        (Some(x), Some(y)) => bson_cmp(x, y),
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                    };
                    let ord = if *ascending { ord } else { ord.reverse() };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let Some(&idx) = candidate_indices.first() else {
            return Ok(None);
        };

        apply_update(&mut entries[idx], &update);
        Ok(Some(entries[idx].clone()))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, MetadataError> {
        let mut guard = self.collections.lock();
        let entries = guard.entry(collection.to_string()).or_default();
        let mut count = 0u64;
        for doc in entries.iter_mut() {
            if Self::matches(doc, &filter) {
                apply_update(doc, &update);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        _sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>, MetadataError> {
        let guard = self.collections.lock();
        let mut matched: Vec<Document> = guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| Self::matches(d, &filter)).cloned().collect())
            .unwrap_or_default();
        if let Some(skip) = skip {
            matched = matched.into_iter().skip(skip as usize).collect();
        }
        if let Some(limit) = limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Applies a tiny subset of Mongo's update operators (`$set`, `$inc`,
/// `$push` with `$slice`) sufficient for this crate's own usage, including
/// dotted-path keys like `"progress.error_count"`.
fn apply_update(doc: &mut Document, update: &Document) {
    if let Some(Bson::Document(set)) = update.get("$set") {
        for (k, v) in set {
            set_path(doc, k, v.clone());
        }
    }
    if let Some(Bson::Document(unset)) = update.get("$unset") {
        for (k, _) in unset {
            remove_path(doc, k);
        }
    }
    if let Some(Bson::Document(inc)) = update.get("$inc") {
        for (k, v) in inc {
            let current = get_path(doc, k).map(|b| bson_as_i64(&b)).unwrap_or(0);
            let delta = bson_as_i64(v);
            set_path(doc, k, Bson::Int64(current + delta));
        }
    }
    if let Some(Bson::Document(push)) = update.get("$push") {
        for (k, v) in push {
            let mut arr = match get_path(doc, k) {
                Some(Bson::Array(a)) => a,
                _ => Vec::new(),
            };
            if let Bson::Document(spec) = v {
                if let Some(Bson::Array(items)) = spec.get("$each") {
                    arr.extend(items.clone());
                }
                if let Some(slice) = spec.get("$slice").and_then(Bson::as_i32) {
                    if slice < 0 {
                        let keep = (-slice) as usize;
                        let len = arr.len();
                        if len > keep {
                            arr = arr[len - keep..].to_vec();
                        }
                    }
                }
            } else {
                arr.push(v.clone());
            }
            set_path(doc, k, Bson::Array(arr));
        }
    }
}

fn bson_as_i64(value: &Bson) -> i64 {
    match value {
        Bson::Int32(v) => *v as i64,
        Bson::Int64(v) => *v,
        Bson::Double(v) => *v as i64,
        _ => 0,
    }
}

fn get_path(doc: &Document, path: &str) -> Option<Bson> {
    let mut parts = path.splitn(2, '.');
    let head = parts.next()?;
    match parts.next() {
        None => doc.get(head).cloned(),
        Some(rest) => match doc.get(head) {
            Some(Bson::Document(nested)) => get_path(nested, rest),
            _ => None,
        },
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let mut parts = path.splitn(2, '.');
    let head = parts.next().unwrap_or(path);
    match parts.next() {
        None => {
            doc.insert(head, value);
        }
        Some(rest) => {
            let nested = match doc.get_mut(head) {
                Some(Bson::Document(d)) => d,
                _ => {
                    doc.insert(head, Bson::Document(Document::new()));
                    doc.get_mut(head).unwrap().as_document_mut().unwrap()
                }
            };
            set_path(nested, rest, value);
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    let mut parts = path.splitn(2, '.');
    let head = parts.next().unwrap_or(path);
    match parts.next() {
        None => {
            doc.remove(head);
        }
        Some(rest) => {
            if let Some(Bson::Document(nested)) = doc.get_mut(head) {
                remove_path(nested, rest);
            }
        }
    }
}

/// In-memory object store: bytes live in a mutex-guarded map, keyed by
/// storage key.
#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    pub reachable: bool,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            reachable: true,
        }
    }

    pub fn seed(&self, key: &str, data: &[u8]) {
        self.objects.lock().insert(key.to_string(), Bytes::copy_from_slice(data));
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put_stream(
        &self,
        key: &str,
        mut body: BodyStream,
        _content_type: &str,
    ) -> Result<PutResult, StorageError> {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let size = buf.len() as u64;
        self.objects.lock().insert(key.to_string(), Bytes::from(buf));
        Ok(PutResult {
            key: key.to_string(),
            size,
        })
    }

    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let data = self
            .objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Box::pin(stream::once(async move { Ok(data) })))
    }

    fn key_gen(&self, original_name: &str) -> String {
        crate::ingest::key_gen(original_name)
    }

    async fn probe(&self) -> bool {
        self.reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_metadata_insert_and_find() {
        let store = FakeMetadataStore::new();
        let id = store.insert_one("widgets", doc! { "name": "foo" }).await.unwrap();
        let found = store.find_one("widgets", doc! { "_id": id }).await.unwrap();
        assert_eq!(found.unwrap().get_str("name").unwrap(), "foo");
    }

    #[tokio::test]
    async fn test_fake_push_with_slice_caps_length() {
        let store = FakeMetadataStore::new();
        let id = store.insert_one("jobs", doc! { "errors": [] }).await.unwrap();
        for i in 0..5 {
            store
                .update_many(
                    "jobs",
                    doc! { "_id": id },
                    doc! { "$push": { "errors": { "$each": [format!("e{i}")], "$slice": -3 } } },
                )
                .await
                .unwrap();
        }
        let doc = store.find_one("jobs", doc! { "_id": id }).await.unwrap().unwrap();
        let errors = doc.get_array("errors").unwrap();
        assert_eq!(errors.len(), 3);
    }
}
