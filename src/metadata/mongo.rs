//! MongoDB-backed implementation of [`MetadataStore`].

use super::traits::{MetadataError, MetadataStore};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Document};
use futures::stream::TryStreamExt;
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Client, Database, IndexModel};
use tracing::{debug, instrument};

const DEFAULT_MIN_POOL_SIZE: u32 = 2;
const DEFAULT_MAX_POOL_SIZE: u32 = 10;

pub struct MongoMetadataStore {
    db: Database,
}

impl MongoMetadataStore {
    /// Connect to MongoDB and ensure the collections this service relies on
    /// carry their required indexes. Index creation is idempotent: MongoDB
    /// is a no-op when an equivalent index already exists.
    #[instrument(skip(uri))]
    pub async fn connect(uri: &str) -> Result<Self, MetadataError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.min_pool_size = Some(DEFAULT_MIN_POOL_SIZE);
        options.max_pool_size = Some(DEFAULT_MAX_POOL_SIZE);
        let client = Client::with_options(options)?;

        let db_name = client
            .default_database()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| "lineloom".to_string());
        let db = client.database(&db_name);

        let store = Self { db };
        store.ensure_indexes().await?;
        debug!("connected to MongoDB database: {}", db_name);
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), MetadataError> {
        let files = self.db.collection::<Document>("files");
        files
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "key": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        files
            .create_index(IndexModel::builder().keys(doc! { "created_at": -1 }).build())
            .await?;
        files
            .create_index(IndexModel::builder().keys(doc! { "status": 1 }).build())
            .await?;

        let jobs = self.db.collection::<Document>("jobs");
        jobs.create_index(IndexModel::builder().keys(doc! { "file_id": 1 }).build())
            .await?;
        jobs.create_index(
            IndexModel::builder()
                .keys(doc! { "state": 1, "queued_at": 1 })
                .build(),
        )
        .await?;
        jobs.create_index(
            IndexModel::builder()
                .keys(doc! { "state": 1, "lock_until": 1 })
                .build(),
        )
        .await?;
        jobs.create_index(IndexModel::builder().keys(doc! { "worker_id": 1 }).build())
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MongoMetadataStore {
    #[instrument(skip(self, doc))]
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<ObjectId, MetadataError> {
        let coll = self.db.collection::<Document>(collection);
        let result = coll.insert_one(doc).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| MetadataError::Other("insert did not return an ObjectId".into()))
    }

    #[instrument(skip(self, docs))]
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), MetadataError> {
        if docs.is_empty() {
            return Ok(());
        }
        let coll = self.db.collection::<Document>(collection);
        coll.insert_many(docs).ordered(false).await?;
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, MetadataError> {
        let coll = self.db.collection::<Document>(collection);
        Ok(coll.find_one(filter).await?)
    }

    #[instrument(skip(self, filter, update))]
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>, MetadataError> {
        let coll = self.db.collection::<Document>(collection);
        let mut options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        options.sort = sort;
        Ok(coll.find_one_and_update(filter, update).with_options(options).await?)
    }

    #[instrument(skip(self, filter, update))]
    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, MetadataError> {
        let coll = self.db.collection::<Document>(collection);
        let result = coll.update_many(filter, update).await?;
        Ok(result.matched_count)
    }

    #[instrument(skip(self, filter, sort))]
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>, MetadataError> {
        let coll = self.db.collection::<Document>(collection);
        let mut options = FindOptions::default();
        options.sort = sort;
        options.skip = skip;
        options.limit = limit;
        let cursor = coll.find(filter).with_options(options).await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), MetadataError> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}
