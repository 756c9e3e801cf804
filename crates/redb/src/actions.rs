//! The append-only action log. Ids are dense from zero and allocated from
//! the atomic counter inside the same transaction as the append.

use redb::{ReadableTable, WriteTransaction};

use kairos_core::{
    ActionBody, ActionId, ActionKind, ActionLog, ActionRecord, StoreError, UploadId,
    ACTION_ID_COUNTER,
};

use crate::{decode, encode, Error, ACTION_LOG};

impl crate::Store {
    /// Append inside an existing transaction, so callers can pair the log
    /// entry with other writes atomically.
    pub(crate) fn append_action_in(
        wx: &WriteTransaction,
        body: ActionBody,
    ) -> Result<ActionId, Error> {
        let id = Self::next_id_in(wx, ACTION_ID_COUNTER)? as ActionId;

        let record = ActionRecord { id, body };

        let mut table = wx.open_table(ACTION_LOG)?;
        table.insert(
            (id as u64).to_be_bytes().as_slice(),
            encode(&record)?.as_slice(),
        )?;

        Ok(id)
    }

    fn scan_actions<F>(&self, mut keep: F) -> Result<Vec<ActionRecord>, Error>
    where
        F: FnMut(&ActionRecord) -> bool,
    {
        let rx = self.begin_read()?;
        let table = rx.open_table(ACTION_LOG)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: ActionRecord = decode(value.value())?;
            if keep(&record) {
                out.push(record);
            }
        }

        Ok(out)
    }

    pub(crate) fn find_upload_action(
        &self,
        upload_id: &UploadId,
    ) -> Result<Option<ActionRecord>, Error> {
        let hits = self.scan_actions(|record| {
            record.body.action == ActionKind::Upload
                && record
                    .body
                    .upload_ids
                    .as_ref()
                    .is_some_and(|ids| ids.contains(upload_id))
        })?;

        Ok(hits.into_iter().next())
    }
}

impl ActionLog for crate::Store {
    fn append(&self, body: ActionBody) -> Result<ActionId, StoreError> {
        let wx = self.begin_write()?;
        let id = Self::append_action_in(&wx, body)?;
        wx.commit().map_err(Error::from)?;
        Ok(id)
    }

    fn append_with_id(&self, id: ActionId, body: ActionBody) -> Result<(), StoreError> {
        let record = ActionRecord { id, body };

        let wx = self.begin_write()?;
        {
            let mut table = wx.open_table(ACTION_LOG).map_err(Error::from)?;
            table
                .insert(
                    (id as u64).to_be_bytes().as_slice(),
                    encode(&record)?.as_slice(),
                )
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;

        Ok(())
    }

    fn get(&self, id: ActionId) -> Result<Option<ActionRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(ACTION_LOG).map_err(Error::from)?;

        let value = table
            .get((id as u64).to_be_bytes().as_slice())
            .map_err(Error::from)?;

        match value {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> Result<Vec<ActionRecord>, StoreError> {
        Ok(self.scan_actions(|_| true)?)
    }

    fn input_actions(
        &self,
        input_formats: &[String],
        input_types: &[String],
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let mut hits = self.scan_actions(|record| record.body.feeds(input_formats, input_types))?;
        hits.reverse();
        Ok(hits)
    }

    fn output_actions(&self, analyzer_id: &str) -> Result<Vec<ActionRecord>, StoreError> {
        let mut hits = self.scan_actions(|record| {
            record.body.action == ActionKind::Analyze
                && record.body.analyzer_id.as_deref() == Some(analyzer_id)
        })?;
        hits.reverse();
        Ok(hits)
    }

    fn upload_action(&self, upload_id: &UploadId) -> Result<Option<ActionRecord>, StoreError> {
        Ok(self.find_upload_action(upload_id)?)
    }
}
