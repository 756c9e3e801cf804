//! Upload metadata rows. The control plane only ever writes the
//! per-environment action-id and validity stamps; assignment and validity
//! flips pair the row update with the matching action-log entry in one
//! transaction.

use redb::ReadableTable;
use serde_json::Value;

use kairos_core::{ActionBody, ActionId, MetadataStore, StoreError, UploadId, UploadRecord};

use crate::{decode, encode, Error, METADATA};

/// Subset match of a filter document against the serialized row.
fn matches_filter(row: &UploadRecord, filter: &serde_json::Map<String, Value>) -> bool {
    let Ok(Value::Object(fields)) = serde_json::to_value(row) else {
        return false;
    };

    filter
        .iter()
        .all(|(key, expected)| fields.get(key) == Some(expected))
}

impl crate::Store {
    fn read_upload(
        table: &impl redb::ReadableTable<&'static [u8], &'static [u8]>,
        id: &UploadId,
    ) -> Result<Option<UploadRecord>, Error> {
        let value = table.get(id.as_bytes())?;
        match value {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }
}

impl MetadataStore for crate::Store {
    fn get(&self, id: &UploadId) -> Result<Option<UploadRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(METADATA).map_err(Error::from)?;
        Ok(Self::read_upload(&table, id)?)
    }

    fn put(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let wx = self.begin_write()?;
        {
            let mut table = wx.open_table(METADATA).map_err(Error::from)?;
            table
                .insert(record.id.as_bytes(), encode(record)?.as_slice())
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;
        Ok(())
    }

    fn pending_uploads(
        &self,
        environment: &str,
        filter: Option<&serde_json::Map<String, Value>>,
    ) -> Result<Vec<UploadRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(METADATA).map_err(Error::from)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(Error::from)? {
            let (_, value) = entry.map_err(Error::from)?;
            let record: UploadRecord = decode(value.value())?;

            if !record.is_pending(environment) {
                continue;
            }

            if let Some(filter) = filter {
                if !matches_filter(&record, filter) {
                    continue;
                }
            }

            out.push(record);
        }

        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    fn assign_action_id(
        &self,
        upload_id: &UploadId,
        environment: &str,
    ) -> Result<Option<ActionId>, StoreError> {
        let wx = self.begin_write()?;

        let assigned = {
            let mut table = wx.open_table(METADATA).map_err(Error::from)?;

            let Some(mut record) = Self::read_upload(&table, upload_id)? else {
                return Ok(None);
            };

            if !record.is_pending(environment) {
                return Ok(None);
            }

            // is_pending guarantees these fields
            let (Some(format), Some(start), Some(stop)) = (
                record.meta.format.clone(),
                record.meta.start_time,
                record.meta.stop_time,
            ) else {
                return Ok(None);
            };

            let action_id = Self::append_action_in(
                &wx,
                ActionBody::upload(upload_id.clone(), (start, stop), format),
            )?;

            record.action_ids.insert(environment.to_string(), action_id);
            record.valid.insert(environment.to_string(), true);

            table
                .insert(upload_id.as_bytes(), encode(&record)?.as_slice())
                .map_err(Error::from)?;

            action_id
        };

        wx.commit().map_err(Error::from)?;
        Ok(Some(assigned))
    }

    fn set_valid(
        &self,
        upload_id: &UploadId,
        environment: &str,
        valid: bool,
    ) -> Result<Option<ActionId>, StoreError> {
        let Some(upload_entry) = self.find_upload_action(upload_id)? else {
            return Ok(None);
        };

        let wx = self.begin_write()?;

        let flipped = {
            let mut table = wx.open_table(METADATA).map_err(Error::from)?;

            let Some(mut record) = Self::read_upload(&table, upload_id)? else {
                return Ok(None);
            };

            if !record.action_ids.contains_key(environment) {
                return Ok(None);
            }

            let action_id = Self::append_action_in(
                &wx,
                ActionBody::marked(
                    valid,
                    upload_id.clone(),
                    upload_entry.body.timespans.clone(),
                    upload_entry.body.output_formats.clone(),
                ),
            )?;

            record.valid.insert(environment.to_string(), valid);

            table
                .insert(upload_id.as_bytes(), encode(&record)?.as_slice())
                .map_err(Error::from)?;

            action_id
        };

        wx.commit().map_err(Error::from)?;
        Ok(Some(flipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::{TimeZone, Utc};
    use kairos_core::{ActionKind, ActionLog, UploadMeta};

    fn upload(id: &str, hour: u32) -> UploadRecord {
        UploadRecord {
            id: id.into(),
            complete: true,
            meta: UploadMeta {
                format: Some("fmt0".into()),
                start_time: Some(Utc.with_ymd_and_hms(2016, 6, 12, hour, 0, 0).unwrap()),
                stop_time: Some(Utc.with_ymd_and_hms(2016, 6, 12, hour + 4, 0, 0).unwrap()),
            },
            timestamp: Some(Utc.with_ymd_and_hms(2016, 6, 12, hour, 30, 0).unwrap()),
            action_ids: Default::default(),
            valid: Default::default(),
            extra: Default::default(),
        }
    }

    #[test]
    fn assignment_stamps_row_and_appends_entry() {
        let store = Store::in_memory().unwrap();
        store.put(&upload("u0", 4)).unwrap();

        let action_id = store.assign_action_id(&"u0".into(), "prod").unwrap();
        assert_eq!(action_id, Some(0));

        let row = MetadataStore::get(&store, &"u0".into()).unwrap().unwrap();
        assert_eq!(row.action_ids.get("prod"), Some(&0));
        assert_eq!(row.valid.get("prod"), Some(&true));

        let entry = ActionLog::get(&store, 0).unwrap().unwrap();
        assert_eq!(entry.body.action, ActionKind::Upload);
        assert_eq!(entry.body.upload_ids, Some(vec!["u0".to_string()]));
        assert_eq!(entry.body.output_formats, Some(vec!["fmt0".to_string()]));

        // second assignment is refused
        assert_eq!(store.assign_action_id(&"u0".into(), "prod").unwrap(), None);
    }

    #[test]
    fn pending_respects_filter_and_timestamp_order() {
        let store = Store::in_memory().unwrap();

        let mut early = upload("u-early", 2);
        early
            .extra
            .insert("site".into(), Value::String("zrh".into()));
        store.put(&early).unwrap();

        let mut late = upload("u-late", 8);
        late.extra.insert("site".into(), Value::String("ams".into()));
        store.put(&late).unwrap();

        let pending = store.pending_uploads("prod", None).unwrap();
        let ids: Vec<_> = pending.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u-early", "u-late"]);

        let mut filter = serde_json::Map::new();
        filter.insert("site".into(), Value::String("ams".into()));

        let pending = store.pending_uploads("prod", Some(&filter)).unwrap();
        let ids: Vec<_> = pending.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u-late"]);
    }

    #[test]
    fn validity_flip_appends_marked_entry() {
        let store = Store::in_memory().unwrap();
        store.put(&upload("u0", 4)).unwrap();

        store.assign_action_id(&"u0".into(), "prod").unwrap();

        let marked = store.set_valid(&"u0".into(), "prod", false).unwrap();
        assert_eq!(marked, Some(1));

        let row = MetadataStore::get(&store, &"u0".into()).unwrap().unwrap();
        assert_eq!(row.valid.get("prod"), Some(&false));

        let entry = ActionLog::get(&store, 1).unwrap().unwrap();
        assert_eq!(entry.body.action, ActionKind::MarkedInvalid);
        assert_eq!(entry.body.timespans.len(), 1);

        // unknown upload or unstamped environment are refused
        assert_eq!(store.set_valid(&"zzz".into(), "prod", true).unwrap(), None);
        assert_eq!(store.set_valid(&"u0".into(), "staging", true).unwrap(), None);
    }
}
