//! Replication client: the process-side entry point to the session store.
//!
//! Every call fetches the current handle from the [`ConnectionSupervisor`],
//! stamps this process's [`OwnerId`] into the operation and ships it to the
//! store as one atomic single-key operation.

use crate::codec::{MessagePackCodec, ValueCodec};
use crate::connection::{ConnectionSupervisor, OrphanedDeletion};
use crate::core::{AttributeValue, OwnerId, Payload, Result, SessionError};
use crate::operations::{OperationResult, SessionOperation};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{Instrument, Level, debug_span, event};

pub struct SessionReplicationClient {
    owner: OwnerId,
    supervisor: Arc<ConnectionSupervisor>,
    codec: Arc<dyn ValueCodec>,
}

impl SessionReplicationClient {
    pub fn new(
        owner: OwnerId,
        supervisor: Arc<ConnectionSupervisor>,
        codec: Arc<dyn ValueCodec>,
    ) -> Self {
        Self {
            owner,
            supervisor,
            codec,
        }
    }

    /// Client using the MessagePack codec.
    pub fn with_default_codec(owner: OwnerId, supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self::new(owner, supervisor, Arc::new(MessagePackCodec))
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }

    /// Deletions waiting for the store to come back.
    pub fn orphan_count(&self) -> Result<usize> {
        self.supervisor.orphans().len()
    }

    /// All attributes of `id`, registering this process as an owner.
    /// `None` if the session does not exist in the store.
    pub async fn get_attributes(
        &self,
        id: &str,
    ) -> Result<Option<BTreeMap<String, AttributeValue>>> {
        let operation = SessionOperation::GetSessionState {
            owner_id: self.owner.to_string(),
        };
        let Some(state) = self.execute(id, operation).await?.into_state()? else {
            return Ok(None);
        };
        let mut attributes = BTreeMap::new();
        for (name, payload) in &state.attributes {
            attributes.insert(name.clone(), self.codec.decode(payload)?);
        }
        Ok(Some(attributes))
    }

    pub async fn get_attribute(&self, id: &str, name: &str) -> Result<Option<AttributeValue>> {
        let operation = SessionOperation::GetAttribute {
            attribute_name: name.to_string(),
            owner_id: self.owner.to_string(),
        };
        match self.execute(id, operation).await?.into_attribute()? {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn get_attribute_names(&self, id: &str) -> Result<Option<BTreeSet<String>>> {
        let operation = SessionOperation::GetAttributeNames {
            owner_id: self.owner.to_string(),
        };
        self.execute(id, operation).await?.into_names()
    }

    /// Stores `value` under `name`; `None` removes the attribute.
    pub async fn set_attribute(
        &self,
        id: &str,
        name: &str,
        value: Option<&AttributeValue>,
    ) -> Result<bool> {
        let mut updates = BTreeMap::new();
        updates.insert(name.to_string(), value.cloned());
        self.update_attributes(id, &updates).await
    }

    pub async fn delete_attribute(&self, id: &str, name: &str) -> Result<bool> {
        self.set_attribute(id, name, None).await
    }

    /// Applies every update in one store call. A `None` value is a tombstone;
    /// names missing from `updates` are left unchanged.
    pub async fn update_attributes(
        &self,
        id: &str,
        updates: &BTreeMap<String, Option<AttributeValue>>,
    ) -> Result<bool> {
        let encoded = self.encode_updates(updates)?;
        let operation = SessionOperation::UpdateAttributes {
            owner_id: self.owner.to_string(),
            updates: encoded,
        };
        self.execute(id, operation).await?.into_updated()
    }

    /// Releases this process's hold on `id`, deleting the record when
    /// `invalidate` is set or no holder remains.
    ///
    /// Never fails: when the store cannot be reached the deletion is queued
    /// and replayed after the next reconnect, and `false` is returned.
    /// Failures that replaying cannot fix, such as a rejected record, are
    /// logged and dropped so they do not block the queue.
    pub async fn delete_session(&self, id: &str, invalidate: bool) -> bool {
        let operation = SessionOperation::DeleteSession {
            owner_id: self.owner.to_string(),
            invalidate,
        };
        match self.execute(id, operation).await {
            Ok(_) => true,
            Err(err) if !err.is_retryable() && err != SessionError::ShutDown => {
                event!(
                    Level::ERROR,
                    session_id = id,
                    invalidate,
                    error = %err,
                    "session deletion rejected by store"
                );
                false
            }
            Err(err) => {
                let orphan = OrphanedDeletion {
                    session_id: id.to_string(),
                    owner_id: self.owner.to_string(),
                    invalidate,
                };
                match self.supervisor.orphans().push(orphan) {
                    Ok(queued) => event!(
                        Level::WARN,
                        session_id = id,
                        invalidate,
                        queued,
                        error = %err,
                        "session deletion deferred to orphan queue"
                    ),
                    Err(queue_err) => event!(
                        Level::ERROR,
                        session_id = id,
                        error = %queue_err,
                        "could not queue orphaned session deletion"
                    ),
                }
                false
            }
        }
    }

    /// Adds (`increment`) or drops an anonymous hold on `id` and returns the
    /// number of holders left. Unlike [`Self::delete_session`] this is not idempotent, so
    /// a failed call is surfaced rather than retried.
    pub async fn adjust_owner_count(&self, id: &str, increment: bool) -> Result<i32> {
        let operation = SessionOperation::AdjustOwnerCount { increment };
        self.execute(id, operation).await?.into_owner_count()
    }

    fn encode_updates(
        &self,
        updates: &BTreeMap<String, Option<AttributeValue>>,
    ) -> Result<BTreeMap<String, Option<Payload>>> {
        updates
            .iter()
            .map(|(name, value)| {
                let payload = value
                    .as_ref()
                    .map(|value| self.codec.encode(value))
                    .transpose()?;
                Ok((name.clone(), payload))
            })
            .collect()
    }

    async fn execute(&self, id: &str, operation: SessionOperation) -> Result<OperationResult> {
        let span = debug_span!(
            "session.op",
            kind = %operation.kind(),
            session_id = id,
            owner = %self.owner
        );
        async {
            let handle = self.supervisor.ensure_ready().await?;
            match handle.execute(id, &operation).await {
                Ok(result) => Ok(result),
                Err(err) => {
                    if err.is_retryable() {
                        self.supervisor.mark_failed(&err);
                    }
                    event!(Level::DEBUG, error = %err, "session operation failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for SessionReplicationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReplicationClient")
            .field("owner", &self.owner)
            .field("codec", &self.codec.name())
            .field("connected", &self.supervisor.is_connected())
            .finish()
    }
}
