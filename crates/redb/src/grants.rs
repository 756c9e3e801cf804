//! Credential grants for agents. Reaped by identifier prefix at supervisor
//! boot to clean up after a crashed predecessor.

use kairos_core::{GrantRecord, GrantStore, StoreError};
use redb::ReadableTable;

use crate::{decode, encode, Error, GRANTS};

impl GrantStore for crate::Store {
    fn provision(&self, grant: &GrantRecord) -> Result<(), StoreError> {
        let wx = self.begin_write()?;
        {
            let mut table = wx.open_table(GRANTS).map_err(Error::from)?;
            table
                .insert(grant.identifier.as_bytes(), encode(grant)?.as_slice())
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<GrantRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(GRANTS).map_err(Error::from)?;

        let value = table.get(identifier.as_bytes()).map_err(Error::from)?;
        match value {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn revoke(&self, identifier: &str) -> Result<bool, StoreError> {
        let wx = self.begin_write()?;
        let removed = {
            let mut table = wx.open_table(GRANTS).map_err(Error::from)?;
            let existed = table
                .remove(identifier.as_bytes())
                .map_err(Error::from)?
                .is_some();
            existed
        };
        wx.commit().map_err(Error::from)?;
        Ok(removed)
    }

    fn identifiers_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(GRANTS).map_err(Error::from)?;

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
}
