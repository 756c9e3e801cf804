//! The authoritative observations collection. Validity history is
//! append-only; the fix-up ops after a commit only ever pop the stamp the
//! same commit pushed.

use itertools::Itertools;
use redb::ReadableTable;

use kairos_core::{
    ActionId, CandidateQuery, Observation, ObservationId, ObservationOp, ObservationStore,
    StoreError, ValidityStamp,
};

use crate::{decode, encode, Error, OBSERVATIONS};

const OBSERVATION_ID_COUNTER: &str = "observation_id";

/// Bulk writes are grouped into blocks of this many ops per transaction.
const BULK_BLOCK: usize = 1000;

impl crate::Store {
    fn scan_observations<F>(&self, mut keep: F) -> Result<Vec<(ObservationId, Observation)>, Error>
    where
        F: FnMut(&Observation) -> bool,
    {
        let rx = self.begin_read()?;
        let table = rx.open_table(OBSERVATIONS)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let obs: Observation = decode(value.value())?;
            if keep(&obs) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(key.value());
                out.push((u64::from_be_bytes(buf), obs));
            }
        }

        Ok(out)
    }
}

impl ObservationStore for crate::Store {
    fn get(&self, id: ObservationId) -> Result<Option<Observation>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(OBSERVATIONS).map_err(Error::from)?;

        let value = table.get(id.to_be_bytes().as_slice()).map_err(Error::from)?;
        match value {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> Result<Vec<(ObservationId, Observation)>, StoreError> {
        Ok(self.scan_observations(|_| true)?)
    }

    fn candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<(ObservationId, Observation)>, StoreError> {
        Ok(self.scan_observations(|obs| query.matches(obs))?)
    }

    fn push_invalidations(
        &self,
        query: &CandidateQuery,
        action_id: ActionId,
    ) -> Result<usize, StoreError> {
        let hits = self.scan_observations(|obs| query.matches(obs) && obs.is_valid())?;

        let mut marked = 0;
        for block in &hits.iter().chunks(BULK_BLOCK) {
            let wx = self.begin_write()?;
            {
                let mut table = wx.open_table(OBSERVATIONS).map_err(Error::from)?;
                for (id, obs) in block {
                    let mut obs = obs.clone();
                    obs.action_ids.insert(
                        0,
                        ValidityStamp {
                            id: action_id,
                            valid: false,
                        },
                    );
                    table
                        .insert(id.to_be_bytes().as_slice(), encode(&obs)?.as_slice())
                        .map_err(Error::from)?;
                    marked += 1;
                }
            }
            wx.commit().map_err(Error::from)?;
        }

        Ok(marked)
    }

    fn apply(&self, ops: &[ObservationOp]) -> Result<(), StoreError> {
        for block in &ops.iter().chunks(BULK_BLOCK) {
            let wx = self.begin_write()?;
            {
                let mut table = wx.open_table(OBSERVATIONS).map_err(Error::from)?;

                for op in block {
                    match op {
                        ObservationOp::RetractInvalidation { id, action_id } => {
                            let Some(bytes) = table.get(id.to_be_bytes().as_slice()).map_err(Error::from)?
                            else {
                                continue;
                            };
                            let mut obs: Observation = decode(bytes.value())?;
                            drop(bytes);

                            let front_matches = obs.action_ids.first().is_some_and(|stamp| {
                                stamp.id == *action_id && !stamp.valid
                            });
                            let beneath_valid =
                                obs.action_ids.get(1).is_some_and(|stamp| stamp.valid);

                            if front_matches && beneath_valid {
                                obs.action_ids.remove(0);
                                table
                                    .insert(id.to_be_bytes().as_slice(), encode(&obs)?.as_slice())
                                    .map_err(Error::from)?;
                            }
                        }
                        ObservationOp::Revive { id, action_id } => {
                            let Some(bytes) = table.get(id.to_be_bytes().as_slice()).map_err(Error::from)?
                            else {
                                continue;
                            };
                            let mut obs: Observation = decode(bytes.value())?;
                            drop(bytes);

                            let front_invalid =
                                obs.action_ids.first().is_some_and(|stamp| !stamp.valid);

                            if front_invalid {
                                obs.action_ids.insert(
                                    0,
                                    ValidityStamp {
                                        id: *action_id,
                                        valid: true,
                                    },
                                );
                                table
                                    .insert(id.to_be_bytes().as_slice(), encode(&obs)?.as_slice())
                                    .map_err(Error::from)?;
                            }
                        }
                        ObservationOp::Insert { observation } => {
                            let id = Self::next_id_in(&wx, OBSERVATION_ID_COUNTER)?;
                            table
                                .insert(
                                    id.to_be_bytes().as_slice(),
                                    encode(observation)?.as_slice(),
                                )
                                .map_err(Error::from)?;
                        }
                    }
                }
            }
            wx.commit().map_err(Error::from)?;
        }

        Ok(())
    }
}
