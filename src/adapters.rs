use kairos_core::Domain;
use kairos_redb::Store;

/// Wires the core store traits to the concrete backend. One shared store
/// per environment; every control loop gets a clone.
#[derive(Clone)]
pub struct DomainAdapter {
    store: Store,
    environment: String,
}

impl DomainAdapter {
    pub fn new(store: Store, environment: impl Into<String>) -> Self {
        Self {
            store,
            environment: environment.into(),
        }
    }
}

impl Domain for DomainAdapter {
    type Analyzers = Store;
    type Actions = Store;
    type Observations = Store;
    type Scratch = Store;
    type Metadata = Store;
    type Requests = Store;
    type Grants = Store;
    type Ids = Store;

    fn environment(&self) -> &str {
        &self.environment
    }

    fn analyzers(&self) -> &Store {
        &self.store
    }

    fn actions(&self) -> &Store {
        &self.store
    }

    fn observations(&self) -> &Store {
        &self.store
    }

    fn scratch(&self) -> &Store {
        &self.store
    }

    fn metadata(&self) -> &Store {
        &self.store
    }

    fn requests(&self) -> &Store {
        &self.store
    }

    fn grants(&self) -> &Store {
        &self.store
    }

    fn ids(&self) -> &Store {
        &self.store
    }
}
