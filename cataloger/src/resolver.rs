//! Name-to-object resolution with per-name single-flight memoization and
//! best-effort lazy creation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use cataloger_core::{CatalogerError, ObjectId, ObjectKind, Result};

use crate::client::{DocumentClient, NewObject};

#[async_trait]
pub trait ObjectResolver: Send + Sync {
    async fn get_by_name(&self, kind: ObjectKind, name: &str) -> Result<ObjectId>;
    async fn get_or_create_by_name(&self, kind: ObjectKind, name: &str) -> Result<ObjectId>;
}

/// Default ownership/permissions applied to anything the resolver creates,
/// filled in uniformly on every creatable object kind rather than through
/// per-type reflection.
#[derive(Debug, Clone, Default)]
pub struct DefaultOwnership {
    pub owner: Option<ObjectId>,
    pub view_users: Vec<ObjectId>,
    pub view_groups: Vec<ObjectId>,
    pub change_users: Vec<ObjectId>,
    pub change_groups: Vec<ObjectId>,
}

impl DefaultOwnership {
    fn apply(&self, name: &str) -> NewObject {
        NewObject {
            name: name.to_string(),
            owner: self.owner,
            view_users: self.view_users.clone(),
            view_groups: self.view_groups.clone(),
            change_users: self.change_users.clone(),
            change_groups: self.change_groups.clone(),
        }
    }
}

type FlightKey = (ObjectKind, String);
type FlightResult = std::result::Result<ObjectId, Arc<CatalogerError>>;

/// Deduplicates concurrent operations sharing the same key: the first
/// caller runs the work, later callers observe the same in-flight cell and
/// get the same result once it resolves.
#[derive(Default)]
struct SingleFlightGroup {
    inflight: Mutex<HashMap<FlightKey, Arc<OnceCell<FlightResult>>>>,
}

impl SingleFlightGroup {
    async fn run<F, Fut>(&self, key: FlightKey, f: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ObjectId>>,
    {
        let cell = {
            let mut map = self.inflight.lock().await;
            map.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let result = cell.get_or_init(|| async { f().await.map_err(Arc::new) }).await.clone();
        self.inflight.lock().await.remove(&key);
        result
    }
}

fn unwrap_flight_error(err: Arc<CatalogerError>) -> CatalogerError {
    match Arc::try_unwrap(err) {
        Ok(owned) => owned,
        Err(shared) => CatalogerError::Other(shared.to_string()),
    }
}

pub struct RemoteResolver<C: DocumentClient> {
    client: Arc<C>,
    ownership: DefaultOwnership,
    lookups: SingleFlightGroup,
    creates: SingleFlightGroup,
}

impl<C: DocumentClient> RemoteResolver<C> {
    pub fn new(client: Arc<C>, ownership: DefaultOwnership) -> Self {
        Self {
            client,
            ownership,
            lookups: SingleFlightGroup::default(),
            creates: SingleFlightGroup::default(),
        }
    }

    async fn lookup_once(&self, kind: ObjectKind, name: &str) -> Result<ObjectId> {
        let matches = self.client.list_objects(kind, name).await?;
        match matches.len() {
            0 => Err(CatalogerError::NotFound),
            1 => Ok(matches[0].id),
            n => Err(CatalogerError::Ambiguous(n)),
        }
    }
}

#[async_trait]
impl<C: DocumentClient> ObjectResolver for RemoteResolver<C> {
    async fn get_by_name(&self, kind: ObjectKind, name: &str) -> Result<ObjectId> {
        let name = name.to_string();
        self.lookups
            .run((kind, name.clone()), move || async move { self.lookup_once(kind, &name).await })
            .await
            .map_err(unwrap_flight_error)
    }

    async fn get_or_create_by_name(&self, kind: ObjectKind, name: &str) -> Result<ObjectId> {
        match self.get_by_name(kind, name).await {
            Ok(id) => Ok(id),
            Err(CatalogerError::NotFound) if kind.create_supported() => {
                let name_owned = name.to_string();
                self.creates
                    .run((kind, name_owned.clone()), move || async move {
                        let fields = self.ownership.apply(&name_owned);
                        match self.client.create_object(kind, &fields).await {
                            Ok(id) => Ok(id),
                            Err(_) => self.lookup_once(kind, &name_owned).await,
                        }
                    })
                    .await
                    .map_err(unwrap_flight_error)
            }
            Err(CatalogerError::NotFound) => Err(CatalogerError::NotFound),
            Err(other) => Err(other),
        }
    }
}
