//! Analyzer records and the gated state transitions.

use redb::ReadableTable;

use kairos_core::{
    check_transition, AnalyzerFailure, AnalyzerRecord, AnalyzerState, AnalyzerStore, OwnerDomain,
    StoreError, TransitionEffects, Wish,
};

use crate::{decode, encode, Error, ANALYZERS};

impl crate::Store {
    fn read_analyzer(
        table: &impl redb::ReadableTable<&'static [u8], &'static [u8]>,
        id: &str,
    ) -> Result<Option<AnalyzerRecord>, Error> {
        let value = table.get(id.as_bytes())?;
        match value {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn update_analyzer<F>(&self, id: &str, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut AnalyzerRecord) -> bool,
    {
        let wx = self.begin_write()?;

        let applied = {
            let mut table = wx.open_table(ANALYZERS).map_err(Error::from)?;

            let mut record = Self::read_analyzer(&table, id)?
                .ok_or_else(|| StoreError::UnknownAnalyzer(id.to_string()))?;

            if mutate(&mut record) {
                table
                    .insert(id.as_bytes(), encode(&record)?.as_slice())
                    .map_err(Error::from)?;
                true
            } else {
                false
            }
        };

        wx.commit().map_err(Error::from)?;
        Ok(applied)
    }
}

fn apply_effects(record: &mut AnalyzerRecord, effects: TransitionEffects) {
    if let Some(result) = effects.set_execution_result {
        record.execution_result = Some(result);
    }

    if effects.clear_execution_result {
        record.execution_result = None;
    }

    if let Some(action_id) = effects.set_action_id {
        record.action_id = Some(action_id);
    }

    if let Some(failure) = effects.set_error {
        record.error = Some(failure);
    }

    if effects.clear_error {
        record.error = None;
    }

    if effects.clear_wish {
        record.wish = None;
    }
}

impl AnalyzerStore for crate::Store {
    fn create(&self, record: &AnalyzerRecord) -> Result<(), StoreError> {
        let wx = self.begin_write()?;
        {
            let mut table = wx.open_table(ANALYZERS).map_err(Error::from)?;
            table
                .insert(record.id.as_bytes(), encode(record)?.as_slice())
                .map_err(Error::from)?;
        }
        wx.commit().map_err(Error::from)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<AnalyzerRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(ANALYZERS).map_err(Error::from)?;
        Ok(Self::read_analyzer(&table, id)?)
    }

    fn all(&self) -> Result<Vec<AnalyzerRecord>, StoreError> {
        let rx = self.begin_read()?;
        let table = rx.open_table(ANALYZERS).map_err(Error::from)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(Error::from)? {
            let (_, value) = entry.map_err(Error::from)?;
            out.push(decode(value.value())?);
        }

        Ok(out)
    }

    fn in_states(&self, states: &[AnalyzerState]) -> Result<Vec<AnalyzerRecord>, StoreError> {
        let mut all = self.all()?;
        all.retain(|a| states.contains(&a.state));
        Ok(all)
    }

    fn transition(
        &self,
        id: &str,
        from: AnalyzerState,
        to: AnalyzerState,
        effects: TransitionEffects,
    ) -> Result<bool, StoreError> {
        check_transition(from, to)?;

        self.update_analyzer(id, |record| {
            if record.state != from {
                return false;
            }

            record.state = to;
            apply_effects(record, effects);
            true
        })
    }

    fn fail(&self, id: &str, domain: OwnerDomain, reason: &str) -> Result<(), StoreError> {
        self.update_analyzer(id, |record| {
            record.state = AnalyzerState::Error;
            record.error = Some(AnalyzerFailure::new(domain, reason));
            true
        })?;
        Ok(())
    }

    fn set_wish(&self, id: &str, wish: Option<Wish>) -> Result<(), StoreError> {
        self.update_analyzer(id, |record| {
            record.wish = wish;
            true
        })?;
        Ok(())
    }

    fn set_stalled_reason(&self, id: &str, reason: Option<&str>) -> Result<(), StoreError> {
        self.update_analyzer(id, |record| {
            record.stalled_reason = reason.map(String::from);
            true
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn analyzer(id: &str) -> AnalyzerRecord {
        let mut record = AnalyzerRecord::new(
            id,
            vec!["format0".into()],
            vec![],
            vec!["type0".into()],
            vec!["./run".into()],
            "/tmp/repo",
        );
        record.state = AnalyzerState::Sensing;
        record
    }

    #[test]
    fn cas_transition_wins_once() {
        let store = Store::in_memory().unwrap();
        store.create(&analyzer("a")).unwrap();

        let won = store
            .transition(
                "a",
                AnalyzerState::Sensing,
                AnalyzerState::Planned,
                TransitionEffects::none(),
            )
            .unwrap();
        assert!(won);

        // second attempt loses softly
        let won = store
            .transition(
                "a",
                AnalyzerState::Sensing,
                AnalyzerState::Planned,
                TransitionEffects::none(),
            )
            .unwrap();
        assert!(!won);

        assert_eq!(store.get("a").unwrap().unwrap().state, AnalyzerState::Planned);
    }

    #[test]
    fn unsupported_transition_is_rejected() {
        let store = Store::in_memory().unwrap();
        store.create(&analyzer("a")).unwrap();

        let result = store.transition(
            "a",
            AnalyzerState::Sensing,
            AnalyzerState::Executed,
            TransitionEffects::none(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn fail_stamps_domain_and_reason() {
        let store = Store::in_memory().unwrap();
        store.create(&analyzer("a")).unwrap();

        store.fail("a", OwnerDomain::Supervisor, "boom").unwrap();

        let record = store.get("a").unwrap().unwrap();
        assert_eq!(record.state, AnalyzerState::Error);
        let failure = record.error.unwrap();
        assert_eq!(failure.domain, OwnerDomain::Supervisor);
        assert_eq!(failure.reason, "boom");
    }

    #[test]
    fn blocked_and_unstable_types_union_running_analyzers() {
        let store = Store::in_memory().unwrap();

        let mut a = analyzer("a");
        a.state = AnalyzerState::Executing;
        a.input_types = vec!["t-in".into()];
        a.output_types = vec!["t-out".into()];
        store.create(&a).unwrap();

        let mut b = analyzer("b");
        b.state = AnalyzerState::Sensing;
        b.input_types = vec!["quiet-in".into()];
        b.output_types = vec!["quiet-out".into()];
        store.create(&b).unwrap();

        assert_eq!(store.blocked_types().unwrap(), vec!["t-in".to_string()]);
        assert_eq!(store.unstable_types().unwrap(), vec!["t-out".to_string()]);
    }

    #[test]
    fn wish_can_be_set_and_cleared_by_transition() {
        let store = Store::in_memory().unwrap();
        store.create(&analyzer("a")).unwrap();

        store.set_wish("a", Some(Wish::Cancel)).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().wish, Some(Wish::Cancel));

        let effects = TransitionEffects::error(AnalyzerFailure::new(
            OwnerDomain::Sensor,
            "cancelled upon request",
        ));
        let won = store
            .transition("a", AnalyzerState::Sensing, AnalyzerState::Error, effects)
            .unwrap();
        assert!(won);

        let record = store.get("a").unwrap().unwrap();
        assert_eq!(record.wish, None);
        assert_eq!(record.state, AnalyzerState::Error);
    }
}
