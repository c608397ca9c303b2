//! Typed record access over [`StorageBackend`].
//!
//! Each primary entity implements [`Record`], binding the type to its table
//! and primary-key encoding. [`RecordStore`] then provides get/put/delete
//! over the wire codec without per-entity boilerplate.
//!
//! Posts are the one composite-keyed entity: they partition by author and
//! cluster by post id, which co-locates a user's posts, so fetching a post
//! always requires the `(author, post)` pair. Every index row that points at
//! a post therefore carries the author id in its value.

use std::marker::PhantomData;
use std::sync::Arc;

use plaza_types::codec::{self, CodecError};
use plaza_types::{
    Channel, ChannelId, Discussion, DiscussionId, Post, PostId, Project, ProjectId, Topic,
    TopicId, User, UserId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};

use crate::engine::{BackendError, StorageBackend};
use crate::keys::{encode_id, encode_pair};
use crate::tables::TableId;

/// Errors from typed record operations.
#[derive(Debug, Snafu)]
pub enum RecordError {
    /// The backend rejected or failed the operation.
    #[snafu(display("backend failure"))]
    Backend {
        /// Underlying backend error.
        source: BackendError,
    },

    /// Row bytes failed to encode or decode.
    #[snafu(display("codec failure in {table}", table = table.name()))]
    Codec {
        /// Table holding the offending row.
        table: TableId,
        /// Underlying codec error.
        source: CodecError,
    },
}

impl RecordError {
    /// Whether retrying the same operation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source } => source.is_retryable(),
            Self::Codec { .. } => false,
        }
    }
}

/// A primary entity stored as one row in its own table.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table this record lives in.
    const TABLE: TableId;
    /// Typed primary key.
    type Key: Copy + Send + Sync;

    /// This record's key.
    fn key(&self) -> Self::Key;

    /// Storage encoding of a key.
    fn encode_key(key: Self::Key) -> Vec<u8>;
}

impl Record for Post {
    const TABLE: TableId = TableId::Posts;
    type Key = (UserId, PostId);

    fn key(&self) -> Self::Key {
        (self.user_id, self.id)
    }

    fn encode_key((user, post): Self::Key) -> Vec<u8> {
        encode_pair(user.value(), post.value())
    }
}

macro_rules! id_keyed_record {
    ($entity:ty, $table:expr, $key:ty) => {
        impl Record for $entity {
            const TABLE: TableId = $table;
            type Key = $key;

            fn key(&self) -> Self::Key {
                self.id
            }

            fn encode_key(key: Self::Key) -> Vec<u8> {
                encode_id(key.value())
            }
        }
    };
}

id_keyed_record!(User, TableId::Users, UserId);
id_keyed_record!(Discussion, TableId::Discussions, DiscussionId);
id_keyed_record!(Topic, TableId::Topics, TopicId);
id_keyed_record!(Channel, TableId::Channels, ChannelId);
id_keyed_record!(Project, TableId::Projects, ProjectId);

/// Typed store for one record type.
pub struct RecordStore<R: Record> {
    backend: Arc<dyn StorageBackend>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self { backend: Arc::clone(&self.backend), _marker: PhantomData }
    }
}

impl<R: Record> RecordStore<R> {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend, _marker: PhantomData }
    }

    /// Writes the record, overwriting any prior version.
    pub async fn put(&self, record: &R) -> Result<(), RecordError> {
        let bytes = codec::encode(record).context(CodecSnafu { table: R::TABLE })?;
        self.backend
            .put_row(R::TABLE, &R::encode_key(record.key()), &bytes)
            .await
            .context(BackendSnafu)
    }

    /// Serializes the record into the physical row it occupies.
    ///
    /// Lets the fan-out path stage record rewrites alongside its other
    /// physical writes.
    pub fn to_row(record: &R) -> Result<(Vec<u8>, Vec<u8>), RecordError> {
        let bytes = codec::encode(record).context(CodecSnafu { table: R::TABLE })?;
        Ok((R::encode_key(record.key()), bytes))
    }

    /// Reads the record by key.
    pub async fn get(&self, key: R::Key) -> Result<Option<R>, RecordError> {
        let row = self
            .backend
            .get_row(R::TABLE, &R::encode_key(key))
            .await
            .context(BackendSnafu)?;
        row.map(|bytes| codec::decode(&bytes).context(CodecSnafu { table: R::TABLE }))
            .transpose()
    }

    /// Deletes the record row. Returns whether it existed.
    pub async fn delete(&self, key: R::Key) -> Result<bool, RecordError> {
        self.backend
            .delete_row(R::TABLE, &R::encode_key(key))
            .await
            .context(BackendSnafu)
    }
}
