//! Scratch scopes: per-run isolated write areas for candidate observations.
//! A scope lives from execution start to commit or error and is dropped
//! whole; documents never migrate out of it.

use itertools::Itertools;
use redb::ReadableTable;
use serde_json::Value;

use kairos_core::{
    compare_subdocument, content_hash, ObservationId, ScratchDocId, ScratchObservation,
    ScratchStore, StoreError, ValidityStamp,
};

use crate::{decode, encode, prefix_end, scoped_key, Error, SCRATCH_DOCS, SCRATCH_SCOPES};

impl crate::Store {
    fn scope_doc_count(
        table: &impl redb::ReadableTable<&'static [u8], &'static [u8]>,
        scope: &str,
    ) -> Result<Option<u64>, Error> {
        let value = table.get(scope.as_bytes())?;
        Ok(value.map(|v| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(v.value());
            u64::from_be_bytes(buf)
        }))
    }

    fn update_docs<F>(&self, scope: &str, mut mutate: F) -> Result<usize, StoreError>
    where
        F: FnMut(ScratchDocId, &mut Value) -> Result<bool, StoreError>,
    {
        let docs = self.docs(scope)?;

        let wx = self.begin_write()?;
        let mut touched = 0;
        {
            let mut table = wx.open_table(SCRATCH_DOCS).map_err(Error::from)?;
            for (id, mut doc) in docs {
                if mutate(id, &mut doc)? {
                    table
                        .insert(scoped_key(scope, id).as_slice(), encode(&doc)?.as_slice())
                        .map_err(Error::from)?;
                    touched += 1;
                }
            }
        }
        wx.commit().map_err(Error::from)?;

        Ok(touched)
    }
}

/// Hash a scratch document over its identity fields, canonicalizing the
/// time axis when the document parses cleanly.
fn scratch_hash(doc: &Value) -> String {
    let parsed: Result<ScratchObservation, _> = serde_json::from_value(doc.clone());

    match parsed.and_then(|p| p.content_hash()) {
        Ok(hash) => hash,
        Err(_) => content_hash(&compare_subdocument(doc)),
    }
}

impl ScratchStore for crate::Store {
    fn create_scope(&self, scope: &str) -> Result<(), StoreError> {
        let wx = self.begin_write()?;
        {
            let mut table = wx.open_table(SCRATCH_SCOPES).map_err(Error::from)?;

            if Self::scope_doc_count(&table, scope)?.is_some() {
                return Err(Error::ScopeExists(scope.to_string()).into());
            }

            table
                .insert(scope.as_bytes(), 0u64.to_be_bytes().as_slice())
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;
        Ok(())
    }

    fn drop_scope(&self, scope: &str) -> Result<(), StoreError> {
        let wx = self.begin_write()?;
        {
            let mut scopes = wx.open_table(SCRATCH_SCOPES).map_err(Error::from)?;
            scopes.remove(scope.as_bytes()).map_err(Error::from)?;

            let mut docs = wx.open_table(SCRATCH_DOCS).map_err(Error::from)?;
            let prefix = scoped_key(scope, 0);
            let prefix = &prefix[..prefix.len() - 8];

            docs.extract_if(|key, _| key.starts_with(prefix))
                .map_err(Error::from)?
                .collect_vec();
        }
        wx.commit().map_err(Error::from)?;
        Ok(())
    }

    fn scope_exists(&self, scope: &str) -> Result<bool, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(SCRATCH_SCOPES).map_err(Error::from)?;
        Ok(Self::scope_doc_count(&table, scope)?.is_some())
    }

    fn scopes_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(SCRATCH_SCOPES).map_err(Error::from)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(Error::from)? {
            let (key, _) = entry.map_err(Error::from)?;
            if let Ok(name) = std::str::from_utf8(key.value()) {
                if name.starts_with(prefix) {
                    out.push(name.to_string());
                }
            }
        }

        Ok(out)
    }

    fn insert(&self, scope: &str, doc: &Value) -> Result<ScratchDocId, StoreError> {
        let wx = self.begin_write()?;
        let seq = {
            let mut scopes = wx.open_table(SCRATCH_SCOPES).map_err(Error::from)?;

            let seq = Self::scope_doc_count(&scopes, scope)?
                .ok_or_else(|| StoreError::UnknownScope(scope.to_string()))?;

            scopes
                .insert(scope.as_bytes(), (seq + 1).to_be_bytes().as_slice())
                .map_err(Error::from)?;

            let mut docs = wx.open_table(SCRATCH_DOCS).map_err(Error::from)?;
            docs.insert(scoped_key(scope, seq).as_slice(), encode(doc)?.as_slice())
                .map_err(Error::from)?;

            seq
        };
        wx.commit().map_err(Error::from)?;

        Ok(seq)
    }

    fn docs(&self, scope: &str) -> Result<Vec<(ScratchDocId, Value)>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(SCRATCH_DOCS).map_err(Error::from)?;

        let prefix = scoped_key(scope, 0);
        let prefix = &prefix[..prefix.len() - 8];

        let range = match prefix_end(prefix) {
            Some(end) => table.range(prefix..end.as_slice()),
            None => table.range(prefix..),
        }
        .map_err(Error::from)?;

        let mut out = Vec::new();
        for entry in range {
            let (key, value) = entry.map_err(Error::from)?;
            let key = key.value();
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[key.len() - 8..]);
            out.push((u64::from_be_bytes(buf), decode(value.value())?));
        }

        Ok(out)
    }

    fn stamp_all(&self, scope: &str, action_id: kairos_core::ActionId) -> Result<usize, StoreError> {
        let stamp = serde_json::to_value([ValidityStamp {
            id: action_id,
            valid: true,
        }])
        .map_err(|e| StoreError::corrupt(e))?;

        self.update_docs(scope, |_, doc| {
            let hash = scratch_hash(doc);

            let Some(fields) = doc.as_object_mut() else {
                return Ok(false);
            };

            fields.insert("action_ids".into(), stamp.clone());
            fields.insert("hash".into(), Value::String(hash));
            Ok(true)
        })
    }

    fn set_counterpart(
        &self,
        scope: &str,
        doc_id: ScratchDocId,
        observation: ObservationId,
    ) -> Result<(), StoreError> {
        self.update_docs(scope, |id, doc| {
            if id != doc_id {
                return Ok(false);
            }

            let Some(fields) = doc.as_object_mut() else {
                return Ok(false);
            };

            fields.insert("output_id".into(), Value::from(observation));
            Ok(true)
        })?;
        Ok(())
    }
}
