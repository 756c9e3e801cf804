//! Admin request queue, drained oldest-first with find-and-delete.

use kairos_core::{AdminRequest, RequestRecord, RequestStore, StoreError};
use redb::ReadableTable;

use crate::{decode, encode, Error, REQUESTS};

const REQUEST_ID_COUNTER: &str = "request_id";

impl RequestStore for crate::Store {
    fn submit(&self, receiver: &str, request: AdminRequest) -> Result<u64, StoreError> {
        let wx = self.begin_write()?;

        let id = Self::next_id_in(&wx, REQUEST_ID_COUNTER)?;
        {
            let record = RequestRecord {
                id,
                receiver: receiver.to_string(),
                request,
            };

            let mut table = wx.open_table(REQUESTS).map_err(Error::from)?;
            table
                .insert(id.to_be_bytes().as_slice(), encode(&record)?.as_slice())
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;

        Ok(id)
    }

    fn drain_oldest(&self, receiver: &str) -> Result<Option<RequestRecord>, StoreError> {
        let wx = self.begin_write()?;

        let drained = {
            let mut table = wx.open_table(REQUESTS).map_err(Error::from)?;

            let mut hit: Option<(Vec<u8>, RequestRecord)> = None;
            for entry in table.iter().map_err(Error::from)? {
                let (key, value) = entry.map_err(Error::from)?;
                let record: RequestRecord = decode(value.value())?;
                if record.receiver == receiver {
                    hit = Some((key.value().to_vec(), record));
                    break;
                }
            }

            match hit {
                Some((key, record)) => {
                    table.remove(key.as_slice()).map_err(Error::from)?;
                    Some(record)
                }
                None => None,
            }
        };

        wx.commit().map_err(Error::from)?;
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn drains_in_submission_order() {
        let store = Store::in_memory().unwrap();

        store
            .submit(
                "validator",
                AdminRequest::ValidateUpload {
                    upload_id: "a".into(),
                    valid: false,
                },
            )
            .unwrap();
        store
            .submit(
                "validator",
                AdminRequest::ValidateUpload {
                    upload_id: "b".into(),
                    valid: true,
                },
            )
            .unwrap();

        let first = store.drain_oldest("validator").unwrap().unwrap();
        match first.request {
            AdminRequest::ValidateUpload { upload_id, valid } => {
                assert_eq!(upload_id, "a");
                assert!(!valid);
            }
        }

        let second = store.drain_oldest("validator").unwrap().unwrap();
        match second.request {
            AdminRequest::ValidateUpload { upload_id, .. } => assert_eq!(upload_id, "b"),
        }

        assert!(store.drain_oldest("validator").unwrap().is_none());
    }

    #[test]
    fn receiver_is_respected() {
        let store = Store::in_memory().unwrap();

        store
            .submit(
                "someone-else",
                AdminRequest::ValidateUpload {
                    upload_id: "a".into(),
                    valid: true,
                },
            )
            .unwrap();

        assert!(store.drain_oldest("validator").unwrap().is_none());
        assert!(store.drain_oldest("someone-else").unwrap().is_some());
    }
}
